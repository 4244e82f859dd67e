pub type Result<T> = std::result::Result<T, PingpongError>;

#[derive(Clone, Debug, thiserror::Error)]
pub enum PingpongError {
    #[error("{0}")]
    Libfabric(#[from] LibfabricError),
    #[error("TransportError: {op}: {message}")]
    Transport { op: &'static str, message: String },
    #[error("CompletionError: {0}")]
    Completion(String),
    #[error("ProtocolDesync: {0}")]
    ProtocolDesync(String),
    #[error("ConfigError: {0}")]
    Config(String),
    #[error("ReportError: {0}")]
    Report(String),
    #[error("aborted by another execution context")]
    Aborted,
    #[error("PingpongError: {0}")]
    Custom(&'static str),
}

impl PingpongError {
    pub fn transport(op: &'static str, message: impl Into<String>) -> Self {
        Self::Transport { op, message: message.into() }
    }

    pub fn desync(message: impl Into<String>) -> Self {
        Self::ProtocolDesync(message.into())
    }
}

#[derive(Clone, Debug)]
pub struct LibfabricError {
    pub code: i32,
    pub context: &'static str,
}

impl LibfabricError {
    pub fn new(code: impl TryInto<i32>, context: &'static str) -> Self {
        Self { code: code.try_into().unwrap_or(i32::MIN), context }
    }
}

impl std::fmt::Display for LibfabricError {
    #[cfg(feature = "ofi")]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = unsafe {
            std::ffi::CStr::from_ptr(libfabric_sys::fi_strerror(self.code.abs()))
        };
        write!(
            f,
            "LibfabricError: code {} ({:?}), context: {}",
            self.code, text, self.context
        )
    }

    #[cfg(not(feature = "ofi"))]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LibfabricError: code {}, context: {}", self.code, self.context)
    }
}

impl std::error::Error for LibfabricError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn libfabric_error_names_context() {
        let e: PingpongError = LibfabricError::new(-11i64, "fi_cq_read").into();
        let text = e.to_string();
        assert!(text.starts_with("LibfabricError: code -11"), "{text}");
        assert!(text.ends_with("context: fi_cq_read"), "{text}");
    }

    #[test]
    fn transport_error_display() {
        let e = PingpongError::transport("server_address", "couldn't get server address");
        assert_eq!(
            e.to_string(),
            "TransportError: server_address: couldn't get server address"
        );
    }
}
