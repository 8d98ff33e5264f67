// ABOUTME: Names of the metrics the outbound client records.
// ABOUTME: vkbot-core re-exports these so descriptions and recording share one definition.

pub const BATCHES_TOTAL: &str = "vk_batches_total";
pub const CALLS_TOTAL: &str = "vk_calls_total";
pub const BATCH_FAILURES_TOTAL: &str = "vk_batch_failures_total";
pub const REAUTH_TOTAL: &str = "vk_reauth_total";
pub const CAPTCHA_TOTAL: &str = "vk_captcha_total";
pub const QUEUE_DEPTH: &str = "vk_queue_depth";
