//! Parameter grouping for per-family learning rates.
//!
//! Adapter parameters are grouped by model family (CLIP, T5, backbone). With
//! LoRA+ enabled, the up projections of a family get their own group whose
//! learning rate is the family rate times the configured ratio.

use tracing::info;

/// Adapter parameters trained at one learning rate.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterGroup {
    /// Label such as `"unet"` or `"textencoder 1 plus"`.
    pub description: String,
    /// Full parameter keys, `<adapter name>.<param>`.
    pub param_names: Vec<String>,
    /// Learning rate of the group.
    pub learning_rate: f64,
}

impl ParameterGroup {
    fn labelled(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            param_names: Vec::new(),
            learning_rate: 0.0,
        }
    }

    /// Number of parameters.
    pub fn len(&self) -> usize {
        self.param_names.len()
    }

    /// Whether the group holds no parameters.
    pub fn is_empty(&self) -> bool {
        self.param_names.is_empty()
    }
}

/// Collects family groups, splitting off LoRA+ groups for up projections.
#[derive(Debug, Default)]
pub struct ParameterGroupBuilder {
    groups: Vec<ParameterGroup>,
}

impl ParameterGroupBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one family.
    ///
    /// With `plus_ratio` set, names containing `lora_up` go to a
    /// `"<description> plus"` group at `lr * ratio`. Groups that end up
    /// empty, or whose rate is unset or zero, are left out.
    pub fn add_family<I, S>(
        &mut self,
        description: &str,
        names: I,
        lr: Option<f64>,
        plus_ratio: Option<f64>,
    ) where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut base = ParameterGroup::labelled(description);
        let mut plus = ParameterGroup::labelled(format!("{description} plus"));
        for name in names {
            let name = name.into();
            let target = if plus_ratio.is_some() && name.contains("lora_up") {
                &mut plus
            } else {
                &mut base
            };
            target.param_names.push(name);
        }

        let plus_lr = lr.zip(plus_ratio).map(|(lr, ratio)| lr * ratio);
        for (mut group, lr) in [(base, lr), (plus, plus_lr)] {
            if group.is_empty() {
                continue;
            }
            match lr {
                Some(lr) if lr != 0.0 => {
                    group.learning_rate = lr;
                    self.groups.push(group);
                }
                _ => info!("No learning rate for {}, skipping", group.description),
            }
        }
    }

    /// Finish building.
    pub fn build(self) -> Vec<ParameterGroup> {
        self.groups
    }

    /// One line per group, for logging.
    pub fn summary(&self) -> String {
        let mut out = String::from("Parameter groups:");
        for group in &self.groups {
            out.push_str(&format!(
                "\n  - {}: {} params (lr={:.2e})",
                group.description,
                group.len(),
                group.learning_rate
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NAMES: [&str; 4] = [
        "lora_unet_a.lora_down.weight",
        "lora_unet_a.lora_up.weight",
        "lora_unet_b.lora_down.weight",
        "lora_unet_b.lora_up.weight",
    ];

    #[test]
    fn test_plain_family() {
        let mut builder = ParameterGroupBuilder::new();
        builder.add_family("unet", NAMES, Some(1e-4), None);
        let groups = builder.build();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].description, "unet");
        assert_eq!(groups[0].len(), 4);
        assert!((groups[0].learning_rate - 1e-4).abs() < 1e-12);
    }

    #[test]
    fn test_loraplus_split() {
        let mut builder = ParameterGroupBuilder::new();
        builder.add_family("unet", NAMES, Some(1e-4), Some(16.0));
        assert!(builder.summary().contains("unet plus: 2 params"));
        let groups = builder.build();
        assert_eq!(groups.len(), 2);

        let plus = groups.iter().find(|g| g.description == "unet plus").unwrap();
        assert_eq!(plus.len(), 2);
        assert!((plus.learning_rate - 1.6e-3).abs() < 1e-12);
        assert!(plus.param_names.iter().all(|n| n.contains("lora_up")));

        let base = groups.iter().find(|g| g.description == "unet").unwrap();
        assert!(base.param_names.iter().all(|n| n.contains("lora_down")));
        assert!((base.learning_rate - 1e-4).abs() < 1e-12);
    }

    #[test]
    fn test_zero_or_unset_lr_is_omitted() {
        let mut builder = ParameterGroupBuilder::new();
        builder.add_family("textencoder 1", NAMES, Some(0.0), Some(4.0));
        builder.add_family("textencoder 2", NAMES, None, None);
        builder.add_family("unet", Vec::<String>::new(), Some(1e-4), None);
        assert!(builder.build().is_empty());
    }
}
