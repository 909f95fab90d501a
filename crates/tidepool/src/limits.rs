//! Resource limits for sandboxed execution

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Resource limits applied to sandboxed Python and shell execution.
///
/// Configured once at startup and shared read-only by both controllers.
/// The loop and command caps bound shell interpretation; the wall-clock
/// timeout bounds Python execution at its interruption poll points.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Maximum loop-body iterations observed in one shell call
    pub max_loop_iterations: u64,
    /// Maximum commands executed in one shell call
    pub max_command_count: u64,
    /// Maximum captured bytes per stream (stdout and stderr separately)
    pub max_output_bytes: u64,
    /// Memory ceiling hint passed to the embedded runtime at boot
    pub max_memory_bytes: u64,
    /// Wall-clock timeout for a single Python call
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_loop_iterations: 10_000,
            max_command_count: 1_000,
            max_output_bytes: 1024 * 1024,       // 1 MB per stream
            max_memory_bytes: 256 * 1024 * 1024, // 256 MB
            timeout: Duration::from_secs(30),    // 30 second wall clock
        }
    }
}

impl ResourceLimits {
    /// Check that every field is usable (all caps and the timeout non-zero).
    pub fn validate(&self) -> Result<(), InvalidLimit> {
        if self.max_loop_iterations == 0 {
            return Err(InvalidLimit {
                field: "max_loop_iterations",
            });
        }
        if self.max_command_count == 0 {
            return Err(InvalidLimit {
                field: "max_command_count",
            });
        }
        if self.max_output_bytes == 0 {
            return Err(InvalidLimit {
                field: "max_output_bytes",
            });
        }
        if self.max_memory_bytes == 0 {
            return Err(InvalidLimit {
                field: "max_memory_bytes",
            });
        }
        if self.timeout.is_zero() {
            return Err(InvalidLimit { field: "timeout" });
        }
        Ok(())
    }

    /// Wall-clock timeout in milliseconds, as reported in timeout errors.
    pub fn timeout_ms(&self) -> u64 {
        u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX)
    }
}

/// A resource limit field that failed validation.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid resource limit: {field} must be greater than zero")]
pub struct InvalidLimit {
    /// Name of the offending field.
    pub field: &'static str,
}

/// Helper for serializing Duration as milliseconds
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

/// Buffer that limits how much data can be written
#[derive(Debug, Clone)]
pub struct LimitedBuffer {
    buffer: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl LimitedBuffer {
    /// Create a buffer that keeps at most `limit` bytes.
    pub fn new(limit: usize) -> Self {
        Self {
            buffer: Vec::new(),
            limit,
            truncated: false,
        }
    }

    /// Append data, dropping anything past the limit.
    ///
    /// Always reports the full input length so writers keep making progress
    /// after the cap is hit.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let remaining = self.limit.saturating_sub(self.buffer.len());
        if remaining == 0 {
            self.truncated = true;
            return data.len(); // Pretend we wrote it
        }

        let to_write = data.len().min(remaining);
        self.buffer.extend_from_slice(&data[..to_write]);

        if to_write < data.len() {
            self.truncated = true;
            self.buffer
                .extend_from_slice(b"\n... [output truncated] ...\n");
        }

        data.len()
    }

    /// Consume the buffer, returning captured bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    /// Consume the buffer as text, replacing invalid UTF-8.
    pub fn into_string(self) -> String {
        String::from_utf8_lossy(&self.buffer).into_owned()
    }

    /// Whether any data was dropped.
    pub fn was_truncated(&self) -> bool {
        self.truncated
    }

    /// Captured bytes so far.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }
}

impl std::io::Write for LimitedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        Ok(LimitedBuffer::write(self, buf))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Cap a captured stream at `max_output_bytes`, appending the truncation
/// marker when the cap is exceeded.
pub(crate) fn cap_output(text: &str, limits: &ResourceLimits) -> String {
    let cap = usize::try_from(limits.max_output_bytes).unwrap_or(usize::MAX);
    if text.len() <= cap {
        return text.to_owned();
    }
    let mut buffer = LimitedBuffer::new(cap);
    buffer.write(text.as_bytes());
    buffer.into_string()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::write_literal)]
mod tests {
    use super::*;
    use std::io::Write as _;

    // ==================== ResourceLimits Tests ====================

    #[test]
    fn test_default_limits() {
        let limits = ResourceLimits::default();

        assert_eq!(limits.max_loop_iterations, 10_000);
        assert_eq!(limits.max_command_count, 1_000);
        assert_eq!(limits.max_output_bytes, 1024 * 1024);
        assert_eq!(limits.max_memory_bytes, 256 * 1024 * 1024);
        assert_eq!(limits.timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_default_limits_validate() {
        assert!(ResourceLimits::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_caps() {
        let zeroed = [
            ResourceLimits {
                max_loop_iterations: 0,
                ..Default::default()
            },
            ResourceLimits {
                max_command_count: 0,
                ..Default::default()
            },
            ResourceLimits {
                max_output_bytes: 0,
                ..Default::default()
            },
            ResourceLimits {
                max_memory_bytes: 0,
                ..Default::default()
            },
            ResourceLimits {
                timeout: Duration::ZERO,
                ..Default::default()
            },
        ];

        for limits in zeroed {
            let err = limits.validate().unwrap_err();
            assert!(err.to_string().contains("greater than zero"));
        }
    }

    #[test]
    fn test_validate_names_offending_field() {
        let limits = ResourceLimits {
            max_command_count: 0,
            ..Default::default()
        };

        let err = limits.validate().unwrap_err();
        assert_eq!(err.field, "max_command_count");
    }

    #[test]
    fn test_timeout_ms() {
        let limits = ResourceLimits {
            timeout: Duration::from_millis(2500),
            ..Default::default()
        };

        assert_eq!(limits.timeout_ms(), 2500);
    }

    #[test]
    fn test_limits_serialization() {
        let limits = ResourceLimits {
            max_loop_iterations: 500,
            max_command_count: 50,
            max_output_bytes: 2 * 1024 * 1024,
            max_memory_bytes: 128 * 1024 * 1024,
            timeout: Duration::from_secs(60),
        };

        let json = serde_json::to_string(&limits).unwrap();
        let deserialized: ResourceLimits = serde_json::from_str(&json).unwrap();

        assert_eq!(deserialized.max_loop_iterations, 500);
        assert_eq!(deserialized.max_command_count, 50);
        assert_eq!(deserialized.max_output_bytes, 2 * 1024 * 1024);
        assert_eq!(deserialized.max_memory_bytes, 128 * 1024 * 1024);
        assert_eq!(deserialized.timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_limits_serialization_format() {
        let limits = ResourceLimits {
            timeout: Duration::from_millis(5000),
            ..Default::default()
        };

        let json = serde_json::to_string(&limits).unwrap();

        // Timeout should be serialized as milliseconds
        assert!(json.contains("\"timeout\":5000"));
    }

    // ==================== LimitedBuffer Tests ====================

    #[test]
    fn test_limited_buffer_under_limit() {
        let mut buffer = LimitedBuffer::new(100);

        let written = buffer.write(b"hello world");
        assert_eq!(written, 11);
        assert!(!buffer.was_truncated());
        assert_eq!(buffer.as_bytes(), b"hello world");
    }

    #[test]
    fn test_limited_buffer_at_limit() {
        let mut buffer = LimitedBuffer::new(5);

        let written = buffer.write(b"hello");
        assert_eq!(written, 5);
        assert!(!buffer.was_truncated());
        assert_eq!(buffer.as_bytes(), b"hello");
    }

    #[test]
    fn test_limited_buffer_over_limit_truncates() {
        let mut buffer = LimitedBuffer::new(5);

        let written = buffer.write(b"hello world");
        assert_eq!(written, 11); // Reports full length written (pretends)
        assert!(buffer.was_truncated());

        // Should contain partial data plus truncation message
        let content = buffer.as_bytes();
        assert!(content.starts_with(b"hello"));
        assert!(content.len() > 5); // Contains truncation message
    }

    #[test]
    fn test_limited_buffer_truncation_message() {
        let mut buffer = LimitedBuffer::new(10);

        buffer.write(b"hello world longer text");

        let content = String::from_utf8_lossy(buffer.as_bytes());
        assert!(content.contains("truncated"));
    }

    #[test]
    fn test_limited_buffer_multiple_writes() {
        let mut buffer = LimitedBuffer::new(20);

        buffer.write(b"hello ");
        assert!(!buffer.was_truncated());

        buffer.write(b"world ");
        assert!(!buffer.was_truncated());

        buffer.write(b"this is a long message");
        assert!(buffer.was_truncated());
    }

    #[test]
    fn test_limited_buffer_write_after_truncation() {
        let mut buffer = LimitedBuffer::new(5);

        buffer.write(b"hello world");
        assert!(buffer.was_truncated());

        // Writing more after truncation should still "succeed"
        let written = buffer.write(b"more data");
        assert_eq!(written, 9);
        assert!(buffer.was_truncated());
    }

    #[test]
    fn test_limited_buffer_into_bytes() {
        let mut buffer = LimitedBuffer::new(100);
        buffer.write(b"test data");

        let bytes = buffer.into_bytes();
        assert_eq!(bytes, b"test data");
    }

    #[test]
    fn test_limited_buffer_into_string() {
        let mut buffer = LimitedBuffer::new(100);
        buffer.write(b"test data");

        assert_eq!(buffer.into_string(), "test data");
    }

    #[test]
    fn test_limited_buffer_empty() {
        let buffer = LimitedBuffer::new(100);
        assert!(!buffer.was_truncated());
        assert!(buffer.as_bytes().is_empty());
    }

    #[test]
    fn test_limited_buffer_zero_limit() {
        let mut buffer = LimitedBuffer::new(0);

        let written = buffer.write(b"hello");
        assert_eq!(written, 5);
        assert!(buffer.was_truncated());
    }

    #[test]
    fn test_limited_buffer_io_write_trait() {
        let mut buffer = LimitedBuffer::new(100);

        // Use std::io::Write trait
        writeln!(buffer, "hello {}", "world").unwrap();
        buffer.flush().unwrap();

        assert!(buffer.as_bytes().starts_with(b"hello world\n"));
    }

    #[test]
    fn test_limited_buffer_exact_boundary() {
        // Test writing exactly at the boundary
        let mut buffer = LimitedBuffer::new(10);

        buffer.write(b"12345");
        assert!(!buffer.was_truncated());
        assert_eq!(buffer.as_bytes().len(), 5);

        buffer.write(b"67890");
        assert!(!buffer.was_truncated());
        assert_eq!(buffer.as_bytes().len(), 10);

        // Next write should trigger truncation
        buffer.write(b"x");
        assert!(buffer.was_truncated());
    }

    // ==================== cap_output Tests ====================

    #[test]
    fn test_cap_output_passthrough_under_limit() {
        let limits = ResourceLimits::default();
        assert_eq!(cap_output("short", &limits), "short");
    }

    #[test]
    fn test_cap_output_truncates_over_limit() {
        let limits = ResourceLimits {
            max_output_bytes: 8,
            ..Default::default()
        };

        let capped = cap_output("0123456789abcdef", &limits);
        assert!(capped.starts_with("01234567"));
        assert!(capped.contains("truncated"));
    }
}
