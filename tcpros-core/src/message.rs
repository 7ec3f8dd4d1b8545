//!
//! The message contract consumed by the transport.
//!
//! Message types are produced ahead of time by a schema compiler.  The
//! transport only needs each type to name itself, expose the fingerprint
//! (md5sum) of its schema and move itself in and out of a byte buffer.
//!

use crate::error::MessageError;

/// The fingerprint peers may send to skip the md5sum check.
pub const WILDCARD_MD5SUM: &str = "*";

/// Trait implemented by every payload sent over a topic or service.
pub trait Message: Sized + Send + 'static {
    /// The fully qualified type name, e.g. `std_msgs/String`
    const TYPE: &'static str;
    /// The content hash of the type's schema
    const MD5SUM: &'static str;

    /// Append the serialized form of this message onto `buffer`.
    fn serialize(&self, buffer: &mut Vec<u8>) -> Result<(), MessageError>;

    /// Read a message from the bytes of a single frame
    fn deserialize(data: &[u8]) -> Result<Self, MessageError>;

    /// The type descriptor for this message
    fn descriptor() -> TypeDescriptor {
        TypeDescriptor::new(Self::TYPE, Self::MD5SUM)
    }
}

/// Trait implemented by a service definition pairing a request and a
/// response message under a single type name and fingerprint.
pub trait ServiceType: Send + 'static {
    /// The fully qualified service type name
    const TYPE: &'static str;
    /// The content hash of the service definition
    const MD5SUM: &'static str;
    /// The request message
    type Request: Message;
    /// The response message
    type Response: Message;

    /// The type descriptor for this service
    fn descriptor() -> TypeDescriptor {
        TypeDescriptor::new(Self::TYPE, Self::MD5SUM)
    }
}

/// The name and fingerprint of a message or service type
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TypeDescriptor {
    /// The fully qualified type name
    pub type_name: String,
    /// The schema fingerprint
    pub md5sum: String,
}

impl std::fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.type_name, self.md5sum)
    }
}

impl TypeDescriptor {
    /// Create a new TypeDescriptor
    pub fn new(type_name: impl Into<String>, md5sum: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            md5sum: md5sum.into(),
        }
    }

    /// Whether a topic peer announcing `type_name` and `md5sum` may talk to us.
    ///
    /// Both fields must match unless the peer sent the wildcard fingerprint.
    pub fn matches_topic(&self, type_name: Option<&str>, md5sum: Option<&str>) -> bool {
        match md5sum {
            Some(WILDCARD_MD5SUM) => true,
            Some(md5sum) => type_name == Some(self.type_name.as_str()) && md5sum == self.md5sum,
            None => false,
        }
    }

    /// Whether a service client announcing `type_name` and `md5sum` may call us.
    ///
    /// Some clients omit the `type` field entirely so it is only compared
    /// when present.
    pub fn matches_service(&self, type_name: Option<&str>, md5sum: Option<&str>) -> bool {
        match md5sum {
            Some(WILDCARD_MD5SUM) => true,
            Some(md5sum) => {
                md5sum == self.md5sum && type_name.map_or(true, |name| name == self.type_name)
            }
            None => false,
        }
    }
}

#[inline]
fn take<const N: usize>(data: &[u8]) -> Result<[u8; N], MessageError> {
    data.get(..N)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or(MessageError::InvalidBufferSize {
            needed: N,
            available: data.len(),
        })
}

macro_rules! message_primitive {
    ($primitive_name: ident, $type_name: literal, $md5sum: literal) => {
        impl Message for $primitive_name {
            const TYPE: &'static str = $type_name;
            const MD5SUM: &'static str = $md5sum;

            fn serialize(&self, buffer: &mut Vec<u8>) -> Result<(), MessageError> {
                buffer.extend_from_slice(&self.to_le_bytes());
                Ok(())
            }

            fn deserialize(data: &[u8]) -> Result<Self, MessageError> {
                Ok(Self::from_le_bytes(take(data)?))
            }
        }
    };
}

message_primitive!(u8, "std_msgs/UInt8", "7c8164229e7d2c17eb95e9231617fdee");
message_primitive!(u32, "std_msgs/UInt32", "304a39449588c7f8ce2df6e8001c5fce");
message_primitive!(i32, "std_msgs/Int32", "da5909fbe378aeaf85e547e830cc1bb7");
message_primitive!(i64, "std_msgs/Int64", "34add168574510e6e17f5d23ecc077ef");
message_primitive!(f32, "std_msgs/Float32", "73fcbf46b49191e672908e50842a83d4");
message_primitive!(f64, "std_msgs/Float64", "fdb28210bfa9d7c91146260178d9a584");

impl Message for bool {
    const TYPE: &'static str = "std_msgs/Bool";
    const MD5SUM: &'static str = "8b94c1b53db61fb6aed406028ad6332a";

    fn serialize(&self, buffer: &mut Vec<u8>) -> Result<(), MessageError> {
        buffer.push(u8::from(*self));
        Ok(())
    }

    fn deserialize(data: &[u8]) -> Result<Self, MessageError> {
        Ok(take::<1>(data)?[0] != 0)
    }
}

impl Message for String {
    const TYPE: &'static str = "std_msgs/String";
    const MD5SUM: &'static str = "992ce8a1687cec8c8bd883ec73ca41d1";

    fn serialize(&self, buffer: &mut Vec<u8>) -> Result<(), MessageError> {
        let len = u32::try_from(self.len())
            .map_err(|_| MessageError::Invalid("string longer than u32::MAX".into()))?;
        buffer.extend_from_slice(&len.to_le_bytes());
        buffer.extend_from_slice(self.as_bytes());
        Ok(())
    }

    fn deserialize(data: &[u8]) -> Result<Self, MessageError> {
        let len = u32::from_le_bytes(take(data)?) as usize;
        let body = data.get(4..4 + len).ok_or(MessageError::InvalidBufferSize {
            needed: 4 + len,
            available: data.len(),
        })?;
        String::from_utf8(body.to_vec()).map_err(|_| MessageError::InvalidUtf8)
    }
}

impl Message for () {
    const TYPE: &'static str = "std_msgs/Empty";
    const MD5SUM: &'static str = "d41d8cd98f00b204e9800998ecf8427e";

    fn serialize(&self, _buffer: &mut Vec<u8>) -> Result<(), MessageError> {
        Ok(())
    }

    fn deserialize(_data: &[u8]) -> Result<Self, MessageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::random;

    macro_rules! test_primitive_message {
        ($primitive: ident, $value: expr, $test_name: ident) => {
            #[test]
            fn $test_name() {
                let value: $primitive = $value;
                let mut buffer = Vec::new();
                assert!(value.serialize(&mut buffer).is_ok());
                assert_eq!(buffer.len(), std::mem::size_of::<$primitive>());
                assert_eq!(value, $primitive::deserialize(&buffer).unwrap());
            }
        };
    }

    test_primitive_message!(u8, random(), test_u8_message);
    test_primitive_message!(u32, random(), test_u32_message);
    test_primitive_message!(i32, random(), test_i32_message);
    test_primitive_message!(i64, random(), test_i64_message);
    test_primitive_message!(f32, 2.01f32, test_f32_message);
    test_primitive_message!(f64, 2.01f64, test_f64_message);

    #[test]
    fn test_string_message_is_length_prefixed() {
        let mut buffer = Vec::new();
        String::from("hello").serialize(&mut buffer).unwrap();
        assert_eq!(&buffer[..4], &5u32.to_le_bytes());
        assert_eq!(&buffer[4..], b"hello");
        assert_eq!(String::deserialize(&buffer).unwrap(), "hello");
    }

    #[test]
    fn test_short_buffer_is_rejected() {
        assert_eq!(
            u32::deserialize(&[1, 2]),
            Err(MessageError::InvalidBufferSize {
                needed: 4,
                available: 2
            })
        );
        assert!(String::deserialize(&[10, 0, 0, 0, b'a']).is_err());
    }

    #[test]
    fn test_topic_type_matching() {
        let descriptor = String::descriptor();
        assert!(descriptor.matches_topic(Some("std_msgs/String"), Some(String::MD5SUM)));
        assert!(descriptor.matches_topic(None, Some("*")));
        assert!(!descriptor.matches_topic(Some("std_msgs/String"), Some("deadbeef")));
        assert!(!descriptor.matches_topic(Some("std_msgs/Int32"), Some(String::MD5SUM)));
        assert!(!descriptor.matches_topic(Some("std_msgs/String"), None));
    }

    #[test]
    fn test_service_type_matching() {
        let md5sum = "6a2e34150c00229791cc89ff309fff21";
        let descriptor = TypeDescriptor::new("test_srvs/AddTwoInts", md5sum);
        assert!(descriptor.matches_service(None, Some("6a2e34150c00229791cc89ff309fff21")));
        assert!(descriptor.matches_service(Some("anything/Else"), Some("*")));
        assert!(!descriptor.matches_service(Some("test_srvs/AddTwoInts"), Some("00")));
        assert!(!descriptor.matches_service(Some("other/Type"), Some(md5sum)));
    }
}
