//! Registry value model shared by host and guest
//!
//! Values travel in the same shape the native registry API uses: a name,
//! a raw byte payload and a type tag that says how to read the payload.

use serde::{Deserialize, Serialize};

/// Opaque identifier of a virtual key. `0` is never a live handle.
pub type KeyHandle = u32;

/// Type tag of a registry value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    /// No type
    None,
    /// NUL-terminated string
    String,
    /// String that may contain unexpanded environment references
    ExpandableString,
    /// Raw binary data
    Binary,
    /// 32-bit little-endian integer
    DwordLe,
    /// 32-bit big-endian integer
    DwordBe,
    /// Symbolic link
    Link,
    /// Sequence of NUL-terminated strings ending with an empty string
    MultiString,
    ResourceList,
    FullResourceDescriptor,
    ResourceRequirementsList,
    /// 64-bit little-endian integer
    QwordLe,
    /// Not-found / error sentinel, never persisted
    Invalid,
}

impl ValueType {
    /// Native numeric code for this type
    pub fn code(self) -> u32 {
        match self {
            Self::None => 0,
            Self::String => 1,
            Self::ExpandableString => 2,
            Self::Binary => 3,
            Self::DwordLe => 4,
            Self::DwordBe => 5,
            Self::Link => 6,
            Self::MultiString => 7,
            Self::ResourceList => 8,
            Self::FullResourceDescriptor => 9,
            Self::ResourceRequirementsList => 10,
            Self::QwordLe => 11,
            Self::Invalid => i32::MAX as u32,
        }
    }

    /// Map a native numeric code back to a type; unknown codes are `Invalid`
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => Self::None,
            1 => Self::String,
            2 => Self::ExpandableString,
            3 => Self::Binary,
            4 => Self::DwordLe,
            5 => Self::DwordBe,
            6 => Self::Link,
            7 => Self::MultiString,
            8 => Self::ResourceList,
            9 => Self::FullResourceDescriptor,
            10 => Self::ResourceRequirementsList,
            11 => Self::QwordLe,
            _ => Self::Invalid,
        }
    }

    pub fn is_valid(self) -> bool {
        self != Self::Invalid
    }
}

/// A named, typed value stored under a virtual key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualValue {
    /// Value name; the empty string is the key's default value
    pub name: String,

    /// Raw payload, interpreted according to `value_type`
    #[serde(default)]
    pub data: Option<Vec<u8>>,

    /// Type tag
    pub value_type: ValueType,
}

impl VirtualValue {
    /// Create a value from raw parts
    pub fn new(name: impl Into<String>, data: Option<Vec<u8>>, value_type: ValueType) -> Self {
        Self {
            name: name.into(),
            data,
            value_type,
        }
    }

    /// Sentinel returned by failed queries
    pub fn invalid(name: impl Into<String>) -> Self {
        Self::new(name, None, ValueType::Invalid)
    }

    /// `String` value, encoded as UTF-16LE with a terminating NUL
    pub fn string(name: impl Into<String>, text: &str) -> Self {
        Self::new(name, Some(encode_wide(text)), ValueType::String)
    }

    /// `ExpandableString` value, encoded like [`VirtualValue::string`]
    pub fn expandable_string(name: impl Into<String>, text: &str) -> Self {
        Self::new(name, Some(encode_wide(text)), ValueType::ExpandableString)
    }

    /// `MultiString` value
    pub fn multi_string<S: AsRef<str>>(name: impl Into<String>, items: &[S]) -> Self {
        let mut data = Vec::new();
        for item in items {
            data.extend(encode_wide(item.as_ref()));
        }
        data.extend([0, 0]);
        Self::new(name, Some(data), ValueType::MultiString)
    }

    /// `DwordLe` value
    pub fn dword(name: impl Into<String>, value: u32) -> Self {
        Self::new(name, Some(value.to_le_bytes().to_vec()), ValueType::DwordLe)
    }

    /// `QwordLe` value
    pub fn qword(name: impl Into<String>, value: u64) -> Self {
        Self::new(name, Some(value.to_le_bytes().to_vec()), ValueType::QwordLe)
    }

    /// `Binary` value
    pub fn binary(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self::new(name, Some(data.into()), ValueType::Binary)
    }

    /// Decode a string-typed payload
    pub fn as_string(&self) -> Option<String> {
        match self.value_type {
            ValueType::String | ValueType::ExpandableString | ValueType::Link => {
                self.data.as_deref().map(decode_wide)
            }
            _ => None,
        }
    }

    /// Decode a 32-bit payload, honoring the byte order of the type tag
    pub fn as_dword(&self) -> Option<u32> {
        let bytes: [u8; 4] = self.data.as_deref()?.get(..4)?.try_into().ok()?;
        match self.value_type {
            ValueType::DwordLe => Some(u32::from_le_bytes(bytes)),
            ValueType::DwordBe => Some(u32::from_be_bytes(bytes)),
            _ => None,
        }
    }

    /// Decode a 64-bit payload
    pub fn as_qword(&self) -> Option<u64> {
        if self.value_type != ValueType::QwordLe {
            return None;
        }
        let bytes: [u8; 8] = self.data.as_deref()?.get(..8)?.try_into().ok()?;
        Some(u64::from_le_bytes(bytes))
    }
}

fn encode_wide(text: &str) -> Vec<u8> {
    text.encode_utf16()
        .chain(std::iter::once(0))
        .flat_map(u16::to_le_bytes)
        .collect()
}

fn decode_wide(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .take_while(|unit| *unit != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

/// Status codes mirroring the native registry API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NativeResultCode {
    Success,
    FileNotFound,
    AccessDenied,
    InvalidHandle,
    InvalidParameter,
    MoreData,
    NoMoreItems,
}

impl NativeResultCode {
    /// Win32 error code
    pub fn code(self) -> u32 {
        match self {
            Self::Success => 0,
            Self::FileNotFound => 2,
            Self::AccessDenied => 5,
            Self::InvalidHandle => 6,
            Self::InvalidParameter => 87,
            Self::MoreData => 234,
            Self::NoMoreItems => 259,
        }
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

/// Whether a create-key call found an existing key or made a new one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreationDisposition {
    CreatedNew,
    OpenedExisting,
}

impl CreationDisposition {
    /// Native `REG_CREATED_NEW_KEY` / `REG_OPENED_EXISTING_KEY` code
    pub fn code(self) -> u32 {
        match self {
            Self::CreatedNew => 1,
            Self::OpenedExisting => 2,
        }
    }
}

/// Kind of entry in the virtual file table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    File,
    Directory,
}

/// A path the guest sees, mapped to where its content actually lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Path as requested by the guest
    pub path: String,
    /// Redirected location, relative to the sandbox root
    pub location: String,
    pub kind: FileKind,
}

impl FileEntry {
    pub fn file(path: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            location: location.into(),
            kind: FileKind::File,
        }
    }

    pub fn directory(path: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            location: location.into(),
            kind: FileKind::Directory,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_type_codes() {
        assert_eq!(ValueType::String.code(), 1);
        assert_eq!(ValueType::QwordLe.code(), 11);
        assert_eq!(ValueType::from_code(4), ValueType::DwordLe);
        assert_eq!(ValueType::from_code(42), ValueType::Invalid);
        assert_eq!(ValueType::Invalid.code(), 0x7FFF_FFFF);
    }

    #[test]
    fn test_string_value_is_wide_and_terminated() {
        let value = VirtualValue::string("Version", "1.0");
        assert_eq!(
            value.data.as_deref(),
            Some(&[b'1', 0, b'.', 0, b'0', 0, 0, 0][..])
        );
        assert_eq!(value.as_string().as_deref(), Some("1.0"));
    }

    #[test]
    fn test_dword_byte_order() {
        let le = VirtualValue::dword("n", 0x0102_0304);
        assert_eq!(le.as_dword(), Some(0x0102_0304));

        let be = VirtualValue::new("n", Some(vec![1, 2, 3, 4]), ValueType::DwordBe);
        assert_eq!(be.as_dword(), Some(0x0102_0304));

        let short = VirtualValue::new("n", Some(vec![1]), ValueType::DwordLe);
        assert_eq!(short.as_dword(), None);
    }

    #[test]
    fn test_multi_string_layout() {
        let value = VirtualValue::multi_string("paths", &["a", "b"]);
        assert_eq!(
            value.data.as_deref(),
            Some(&[b'a', 0, 0, 0, b'b', 0, 0, 0, 0, 0][..])
        );
    }

    #[test]
    fn test_invalid_sentinel() {
        let value = VirtualValue::invalid("missing");
        assert!(!value.value_type.is_valid());
        assert!(value.data.is_none());
    }
}
