//! Topic name validation
//!
//! Topic names used in PUBLISH:
//! - Must be at least 1 character
//! - Must not exceed 65535 bytes
//! - Must not contain the null character
//! - Must not contain wildcards (+ or #)

pub fn validate_topic_name(topic: &str) -> Result<(), &'static str> {
    if topic.is_empty() {
        return Err("topic name cannot be empty");
    }
    if topic.len() > 65535 {
        return Err("topic name exceeds maximum length");
    }
    if topic.contains('\0') {
        return Err("topic name cannot contain null character");
    }
    if topic.contains('+') || topic.contains('#') {
        return Err("topic name cannot contain wildcards");
    }
    Ok(())
}
