/// A message received from the broker.
///
/// The core never interprets `payload`; it is handed to the handler exactly
/// as the broker delivered it.
///
/// # Fields
///
/// - `routing_key` - The routing key the message was published under.
/// - `payload` - The raw message body.
/// - `timestamp` - Publish time in seconds since the UNIX epoch, when the
///   publisher set one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub timestamp: Option<i64>,
}

impl Delivery {
    pub fn new(routing_key: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            routing_key: routing_key.into(),
            payload: payload.into(),
            timestamp: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}
