use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use cordwire_util::ValidationError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ModelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageType {
    Png,
    Jpeg,
    Gif,
}

impl ImageType {
    pub fn mime(self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
            Self::Gif => "image/gif",
        }
    }

    pub fn from_mime(mime: &str) -> Result<Self, ValidationError> {
        match mime.trim().to_ascii_lowercase().as_str() {
            "image/png" => Ok(Self::Png),
            "image/jpeg" | "image/jpg" => Ok(Self::Jpeg),
            "image/gif" => Ok(Self::Gif),
            other => Err(ValidationError::ContentType(other.to_string())),
        }
    }

    /// Detect the type from the file's magic number.
    pub fn sniff(data: &[u8]) -> Option<Self> {
        if data.starts_with(b"\x89PNG\r\n\x1a\n") {
            Some(Self::Png)
        } else if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Some(Self::Jpeg)
        } else if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
            Some(Self::Gif)
        } else {
            None
        }
    }
}

/// Image data sent to the API as `data:<mime>;base64,<payload>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub content_type: ImageType,
    pub data: Vec<u8>,
}

impl Image {
    pub fn new(content_type: ImageType, data: Vec<u8>) -> Self {
        Self { content_type, data }
    }

    pub fn from_bytes(data: Vec<u8>) -> Result<Self, ModelError> {
        let content_type = ImageType::sniff(&data)
            .ok_or_else(|| ValidationError::ContentType("unknown image format".to_string()))?;
        Ok(Self { content_type, data })
    }

    pub fn to_data_uri(&self) -> String {
        format!(
            "data:{};base64,{}",
            self.content_type.mime(),
            STANDARD.encode(&self.data)
        )
    }

    pub fn parse(uri: &str) -> Result<Self, ModelError> {
        let rest = uri.strip_prefix("data:").ok_or(ModelError::InvalidDataUri)?;
        let (mime, payload) = rest
            .split_once(";base64,")
            .ok_or(ModelError::InvalidDataUri)?;
        let content_type = ImageType::from_mime(mime)?;
        let data = STANDARD.decode(payload)?;
        Ok(Self { content_type, data })
    }
}

impl fmt::Display for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_data_uri())
    }
}

impl FromStr for Image {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Image {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_data_uri())
    }
}

impl<'de> Deserialize<'de> for Image {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_HEADER: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";

    #[test]
    fn data_uri_round_trip() {
        let image = Image::from_bytes(PNG_HEADER.to_vec()).unwrap();
        assert_eq!(image.content_type, ImageType::Png);

        let uri = image.to_data_uri();
        assert!(uri.starts_with("data:image/png;base64,"));

        let back: Image = uri.parse().unwrap();
        assert_eq!(back.content_type, ImageType::Png);
        assert_eq!(back.data, PNG_HEADER);
    }

    #[test]
    fn rejects_unsupported_mime() {
        let err = Image::parse("data:image/webp;base64,AAAA").unwrap_err();
        assert!(matches!(
            err,
            ModelError::Validation(ValidationError::ContentType(_))
        ));
        assert!(matches!(
            Image::parse("image/png;base64,AAAA"),
            Err(ModelError::InvalidDataUri)
        ));
    }

    #[test]
    fn sniffing() {
        assert_eq!(ImageType::sniff(&[0xFF, 0xD8, 0xFF, 0xE0]), Some(ImageType::Jpeg));
        assert_eq!(ImageType::sniff(b"GIF89a...."), Some(ImageType::Gif));
        assert!(Image::from_bytes(b"plain text".to_vec()).is_err());
    }
}
