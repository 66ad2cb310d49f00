use rand::{thread_rng, Rng};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// 生成Unix时间戳（秒）
pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// 生成UUID
pub fn generate_uuid() -> String {
    Uuid::new_v4().to_string()
}

/// 生成请求ID，形如 req-1a2b3c4d
pub fn generate_request_id() -> String {
    let simple = Uuid::new_v4().simple().to_string();
    format!("req-{}", &simple[..8])
}

/// 区间内随机浮点数
pub fn random_between(min: f64, max: f64) -> f64 {
    if max <= min {
        return min;
    }
    thread_rng().gen_range(min..max)
}

/// 区间内随机整数（闭区间）
pub fn random_int(min: u32, max: u32) -> u32 {
    if max <= min {
        return min;
    }
    thread_rng().gen_range(min..=max)
}

/// 截断字符串用于日志
pub fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let head: String = text.chars().take(max_chars).collect();
    format!("{}...", head)
}
