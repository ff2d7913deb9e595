pub const TOPIC_ROOM_TEMPERATURE: &str = "heating/room/+/temperature";
pub const TOPIC_ROOM_TARGET: &str = "heating/room/+/target";
pub const TOPIC_VALVE_FEEDBACK: &str = "heating/valve/+/feedback";

pub const TOPIC_BOILER_COMMAND: &str = "heating/boiler/command";
pub const TOPIC_CONTROLLER_STATE: &str = "heating/controller/state";

pub fn valve_command_topic(room_id: &str) -> String {
    format!("heating/valve/{room_id}/command")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundTopic<'a> {
    RoomTemperature(&'a str),
    RoomTarget(&'a str),
    ValveFeedback(&'a str),
}

pub fn parse_inbound_topic(topic: &str) -> Option<InboundTopic<'_>> {
    let mut parts = topic.split('/');
    let (Some("heating"), Some(kind), Some(id), Some(leaf), None) = (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) else {
        return None;
    };
    if id.is_empty() {
        return None;
    }

    match (kind, leaf) {
        ("room", "temperature") => Some(InboundTopic::RoomTemperature(id)),
        ("room", "target") => Some(InboundTopic::RoomTarget(id)),
        ("valve", "feedback") => Some(InboundTopic::ValveFeedback(id)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_room_and_valve_topics() {
        assert_eq!(
            parse_inbound_topic("heating/room/study/temperature"),
            Some(InboundTopic::RoomTemperature("study"))
        );
        assert_eq!(
            parse_inbound_topic("heating/room/study/target"),
            Some(InboundTopic::RoomTarget("study"))
        );
        assert_eq!(
            parse_inbound_topic("heating/valve/study/feedback"),
            Some(InboundTopic::ValveFeedback("study"))
        );
    }

    #[test]
    fn rejects_foreign_topics() {
        assert_eq!(parse_inbound_topic("heating/valve/study/command"), None);
        assert_eq!(parse_inbound_topic("heating/room//target"), None);
        assert_eq!(parse_inbound_topic("heating/room/a/b/target"), None);
        assert_eq!(parse_inbound_topic("thermostat/sensor/temperature"), None);
    }

    #[test]
    fn builds_command_topic() {
        assert_eq!(valve_command_topic("hall"), "heating/valve/hall/command");
    }
}
