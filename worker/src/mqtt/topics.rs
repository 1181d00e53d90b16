//! MQTT topic definitions

/// MQTT topic patterns
pub struct Topics;

impl Topics {
    /// Topic backing a named queue
    pub fn queue(queue: &str) -> String {
        format!("deployd/queue/{}", queue)
    }

    /// Subscription filter for a queue, optionally load balanced across a shared group
    pub fn queue_filter(queue: &str, share_group: Option<&str>) -> String {
        match share_group {
            Some(group) if !group.is_empty() => format!("$share/{}/{}", group, Self::queue(queue)),
            _ => Self::queue(queue),
        }
    }

    /// Parse a topic to extract the queue name
    pub fn parse_queue(topic: &str) -> Option<String> {
        topic
            .strip_prefix("deployd/queue/")
            .filter(|queue| !queue.is_empty() && !queue.contains('/'))
            .map(str::to_string)
    }
}
