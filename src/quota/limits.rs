/// 单个模型在一个凭证上的三项配额上限。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelLimits {
    pub rpm: u64,
    pub tpm: u64,
    pub rpd: u64,
}

// 免费层上限；按前缀匹配，最长前缀优先（flash-lite 先于 flash）。
const MODEL_LIMITS: &[(&str, ModelLimits)] = &[
    (
        "gemini-2.5-pro",
        ModelLimits {
            rpm: 5,
            tpm: 250_000,
            rpd: 100,
        },
    ),
    (
        "gemini-2.5-flash-lite",
        ModelLimits {
            rpm: 15,
            tpm: 250_000,
            rpd: 1000,
        },
    ),
    (
        "gemini-2.5-flash",
        ModelLimits {
            rpm: 10,
            tpm: 250_000,
            rpd: 250,
        },
    ),
    (
        "gemini-2.0-flash-lite",
        ModelLimits {
            rpm: 30,
            tpm: 1_000_000,
            rpd: 1500,
        },
    ),
    (
        "gemini-2.0-flash",
        ModelLimits {
            rpm: 15,
            tpm: 1_000_000,
            rpd: 1500,
        },
    ),
    (
        "gemini-1.5-pro",
        ModelLimits {
            rpm: 2,
            tpm: 32_000,
            rpd: 50,
        },
    ),
    (
        "gemini-1.5-flash",
        ModelLimits {
            rpm: 15,
            tpm: 1_000_000,
            rpd: 1500,
        },
    ),
];

const DEFAULT_LIMITS: ModelLimits = ModelLimits {
    rpm: 15,
    tpm: 1_000_000,
    rpd: 1500,
};

pub fn limits_for(model: &str) -> ModelLimits {
    let model = model.trim().to_lowercase();
    let model = model.strip_prefix("models/").unwrap_or(model.as_str());
    MODEL_LIMITS
        .iter()
        .filter(|(prefix, _)| model.starts_with(prefix))
        .max_by_key(|(prefix, _)| prefix.len())
        .map(|(_, limits)| *limits)
        .unwrap_or(DEFAULT_LIMITS)
}
