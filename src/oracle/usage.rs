use serde::{Deserialize, Serialize};

/// API usage information from OpenRouter
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
    /// Cost in USD as reported by OpenRouter (`total_cost` in some payloads).
    #[serde(default, alias = "total_cost")]
    pub cost: Option<f64>,
}

impl Usage {
    /// Reported cost, or 0.0 when the provider did not send one.
    pub fn cost(&self) -> f64 {
        self.cost.unwrap_or(0.0)
    }
}

pub fn merge_usage(primary: Option<Usage>, secondary: Option<Usage>) -> Option<Usage> {
    match (primary, secondary) {
        (Some(p), Some(s)) => Some(Usage {
            prompt_tokens: p.prompt_tokens + s.prompt_tokens,
            completion_tokens: p.completion_tokens + s.completion_tokens,
            total_tokens: p.total_tokens + s.total_tokens,
            cost: match (p.cost, s.cost) {
                (Some(pc), Some(sc)) => Some(pc + sc),
                (pc, sc) => pc.or(sc),
            },
        }),
        (p, s) => p.or(s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_total_cost_alias() {
        let usage: Usage =
            serde_json::from_str(r#"{"prompt_tokens":10,"completion_tokens":5,"total_cost":0.25}"#)
                .unwrap();
        assert_eq!(usage.cost(), 0.25);
        assert_eq!(usage.total_tokens, 0);
    }

    #[test]
    fn merge_adds_counts_and_costs() {
        let a = Usage {
            prompt_tokens: 10,
            completion_tokens: 2,
            total_tokens: 12,
            cost: Some(0.5),
        };
        let b = Usage {
            prompt_tokens: 1,
            completion_tokens: 1,
            total_tokens: 2,
            cost: None,
        };
        let merged = merge_usage(Some(a.clone()), Some(b)).unwrap();
        assert_eq!(merged.total_tokens, 14);
        assert_eq!(merged.cost, Some(0.5));
        assert_eq!(merge_usage(None, Some(a.clone())), Some(a));
        assert_eq!(merge_usage(None, None), None);
    }
}
