//! Wire format of the inference transport.
//!
//! Frames are a 4-byte big-endian length followed by a UTF-8 JSON payload. Numeric arrays
//! travel as `{"__numpy_array__": true, "data": <base64>, "dtype": <str>, "shape": [..]}`
//! with little-endian element bytes.

use std::io::{ErrorKind, Read, Write};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de::DeserializeOwned};
use serde_json::Value;

use crate::error::RemoteError;

pub const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;
pub const TENSOR_MARKER: &str = "__numpy_array__";

pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<(), RemoteError> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(RemoteError::FrameTooLarge(payload.len()));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

/// Reads one frame. A peer that closes before the header yields `RemoteError::Closed`.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Vec<u8>, RemoteError> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Err(RemoteError::Closed),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(RemoteError::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

pub fn send_json<W: Write, T: Serialize>(writer: &mut W, value: &T) -> Result<(), RemoteError> {
    let payload = serde_json::to_vec(value)?;
    write_frame(writer, &payload)
}

pub fn recv_json<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<T, RemoteError> {
    let payload = read_frame(reader)?;
    Ok(serde_json::from_slice(&payload)?)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Float32,
    Float64,
    Int32,
    Int64,
    Uint8,
}

impl DType {
    pub fn size(self) -> usize {
        match self {
            DType::Uint8 => 1,
            DType::Float32 | DType::Int32 => 4,
            DType::Float64 | DType::Int64 => 8,
        }
    }
}

/// Dense n-dimensional array with little-endian element bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    dtype: DType,
    shape: Vec<usize>,
    data: Vec<u8>,
}

impl Tensor {
    pub fn new(dtype: DType, shape: Vec<usize>, data: Vec<u8>) -> Result<Self, RemoteError> {
        let expected = shape.iter().product::<usize>() * dtype.size();
        if data.len() != expected {
            return Err(RemoteError::Tensor(format!(
                "{:?} tensor of shape {:?} needs {} bytes, got {}",
                dtype,
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Self { dtype, shape, data })
    }

    pub fn from_f64(shape: Vec<usize>, values: &[f64]) -> Result<Self, RemoteError> {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(DType::Float64, shape, data)
    }

    pub fn from_f32(shape: Vec<usize>, values: &[f32]) -> Result<Self, RemoteError> {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(DType::Float32, shape, data)
    }

    pub fn from_u8(shape: Vec<usize>, values: Vec<u8>) -> Result<Self, RemoteError> {
        Self::new(DType::Uint8, shape, values)
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Every element widened to `f64`.
    pub fn to_f64(&self) -> Vec<f64> {
        let chunks = self.data.chunks_exact(self.dtype.size());
        match self.dtype {
            DType::Float32 => chunks
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64)
                .collect(),
            DType::Float64 => chunks
                .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect(),
            DType::Int32 => chunks
                .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64)
                .collect(),
            DType::Int64 => chunks
                .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f64)
                .collect(),
            DType::Uint8 => self.data.iter().map(|&b| b as f64).collect(),
        }
    }

    /// Encodes into the JSON tree form, for embedding in observations.
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            TENSOR_MARKER: true,
            "data": STANDARD.encode(&self.data),
            "dtype": self.dtype,
            "shape": self.shape,
        })
    }

    /// Decodes `value` if it is an encoded tensor; `None` for any other value.
    pub fn from_value(value: &Value) -> Option<Result<Self, RemoteError>> {
        if !is_tensor(value) {
            return None;
        }
        Some(Tensor::deserialize(value).map_err(|e| RemoteError::Tensor(e.to_string())))
    }
}

pub fn is_tensor(value: &Value) -> bool {
    value
        .get(TENSOR_MARKER)
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

#[derive(Serialize, Deserialize)]
struct WireTensor {
    #[serde(rename = "__numpy_array__")]
    marker: bool,
    data: String,
    dtype: DType,
    shape: Vec<usize>,
}

impl Serialize for Tensor {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        WireTensor {
            marker: true,
            data: STANDARD.encode(&self.data),
            dtype: self.dtype,
            shape: self.shape.clone(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Tensor {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;
        let wire = WireTensor::deserialize(deserializer)?;
        if !wire.marker {
            return Err(D::Error::custom("tensor marker is false"));
        }
        let data = STANDARD.decode(wire.data.as_bytes()).map_err(D::Error::custom)?;
        Tensor::new(wire.dtype, wire.shape, data).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frame_header_is_big_endian_length() {
        let mut buf = Vec::new();
        send_json(&mut buf, &serde_json::json!({"cmd": "reset", "obs": null})).unwrap();
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(len, buf.len() - 4);

        let back: Value = recv_json(&mut Cursor::new(buf)).unwrap();
        assert_eq!(back["cmd"], "reset");
    }

    #[test]
    fn eof_before_header_is_a_clean_close() {
        let mut empty = Cursor::new(Vec::<u8>::new());
        assert!(matches!(read_frame(&mut empty), Err(RemoteError::Closed)));
    }

    #[test]
    fn oversized_header_is_rejected_without_allocating() {
        let mut bogus = Cursor::new(u32::MAX.to_be_bytes().to_vec());
        assert!(matches!(read_frame(&mut bogus), Err(RemoteError::FrameTooLarge(_))));
    }

    #[test]
    fn tensor_wire_form_matches_numpy_encoding() {
        let tensor = Tensor::from_f32(vec![2], &[1.0, -2.5]).unwrap();
        let value = tensor.to_value();
        assert_eq!(value["__numpy_array__"], true);
        assert_eq!(value["dtype"], "float32");
        assert_eq!(value["shape"], serde_json::json!([2]));
        assert_eq!(value["data"], STANDARD.encode([0u8, 0, 128, 63, 0, 0, 32, 192]));

        let back = Tensor::from_value(&value).unwrap().unwrap();
        assert_eq!(back.to_f64(), vec![1.0, -2.5]);
        assert!(Tensor::from_value(&serde_json::json!({"joint": [1, 2]})).is_none());
    }

    #[test]
    fn tensor_with_wrong_byte_count_is_rejected() {
        assert!(Tensor::new(DType::Int64, vec![3], vec![0; 16]).is_err());
    }
}
