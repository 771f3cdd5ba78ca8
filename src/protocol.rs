//! Binary framing between the dispatcher and worker processes.
//!
//! Request frame: `request_id: u64 | count: u32 | count x f64`.
//! Result frame: `request_id: u64 | status: u8 | count: u32 | count x f64`.
//! Everything is little-endian. Frames carry their own length, so they can
//! travel over plain pipes.

use crate::error::ProtocolError;
use crate::request::RequestId;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::trace;
use std::io::{self, Read, Write};

pub const MAX_VALUES: u32 = 1 << 16;

const REQUEST_HEADER_LEN: usize = 8 + 4;
const RESULT_HEADER_LEN: usize = 8 + 1 + 4;
const VALUE_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Ok = 0,
    Error = 1,
}

impl Status {
    fn from_byte(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            0 => Ok(Status::Ok),
            1 => Ok(Status::Error),
            other => Err(ProtocolError::UnknownStatus(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestFrame {
    pub request_id: RequestId,
    pub params: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResultFrame {
    pub request_id: RequestId,
    pub status: Status,
    pub values: Vec<f64>,
}

impl ResultFrame {
    pub fn from_model_output(request_id: RequestId, output: Option<Vec<f64>>) -> Self {
        match output {
            Some(values) => Self {
                request_id,
                status: Status::Ok,
                values,
            },
            None => Self {
                request_id,
                status: Status::Error,
                values: Vec::new(),
            },
        }
    }
}

/// Encodes a request frame without writing it anywhere.
pub fn encode_request(request_id: RequestId, params: &[f64]) -> io::Result<Bytes> {
    let count = checked_count(params.len())?;
    let mut buf = BytesMut::with_capacity(REQUEST_HEADER_LEN + params.len() * VALUE_LEN);
    buf.put_u64_le(request_id.0);
    buf.put_u32_le(count);
    put_values(&mut buf, params);
    Ok(buf.freeze())
}

pub fn write_request<W: Write>(
    writer: &mut W,
    request_id: RequestId,
    params: &[f64],
) -> io::Result<()> {
    let frame = encode_request(request_id, params)?;
    writer.write_all(&frame)?;
    writer.flush()
}

pub fn write_result<W: Write>(writer: &mut W, frame: &ResultFrame) -> io::Result<()> {
    let count = checked_count(frame.values.len())?;
    let mut buf = BytesMut::with_capacity(RESULT_HEADER_LEN + frame.values.len() * VALUE_LEN);
    buf.put_u64_le(frame.request_id.0);
    buf.put_u8(frame.status as u8);
    buf.put_u32_le(count);
    put_values(&mut buf, &frame.values);
    writer.write_all(&buf)?;
    writer.flush()
}

/// Reads the next request frame. `Ok(None)` means the stream ended cleanly on
/// a frame boundary.
pub fn read_request<R: Read>(reader: &mut R) -> Result<Option<RequestFrame>, ProtocolError> {
    let mut header = [0u8; REQUEST_HEADER_LEN];
    if !read_frame_start(reader, &mut header)? {
        return Ok(None);
    }

    let mut header = &header[..];
    let request_id = RequestId(header.get_u64_le());
    let count = header.get_u32_le();
    let params = read_values(reader, count)?;

    Ok(Some(RequestFrame { request_id, params }))
}

pub fn read_result<R: Read>(reader: &mut R) -> Result<Option<ResultFrame>, ProtocolError> {
    let mut header = [0u8; RESULT_HEADER_LEN];
    if !read_frame_start(reader, &mut header)? {
        return Ok(None);
    }

    let mut header = &header[..];
    let request_id = RequestId(header.get_u64_le());
    let status = Status::from_byte(header.get_u8())?;
    let count = header.get_u32_le();
    let values = read_values(reader, count)?;

    Ok(Some(ResultFrame {
        request_id,
        status,
        values,
    }))
}

/// Worker side of the protocol: answers request frames from `input` with
/// result frames on `output` until `input` ends.
pub fn serve<R, W, F>(input: R, output: W, mut model: F) -> Result<usize, ProtocolError>
where
    R: Read,
    W: Write,
    F: FnMut(&[f64]) -> Option<Vec<f64>>,
{
    let mut input = io::BufReader::new(input);
    let mut output = io::BufWriter::new(output);
    let mut num_served = 0;

    while let Some(request) = read_request(&mut input)? {
        trace!(
            "Evaluating request {} with {} params",
            request.request_id,
            request.params.len()
        );
        let frame = ResultFrame::from_model_output(request.request_id, model(&request.params));
        write_result(&mut output, &frame)?;
        num_served += 1;
    }

    Ok(num_served)
}

fn checked_count(len: usize) -> io::Result<u32> {
    u32::try_from(len)
        .ok()
        .filter(|count| *count <= MAX_VALUES)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} values exceed frame limit of {}", len, MAX_VALUES),
            )
        })
}

fn put_values(buf: &mut BytesMut, values: &[f64]) {
    for value in values {
        buf.put_f64_le(*value);
    }
}

fn read_values<R: Read>(reader: &mut R, count: u32) -> Result<Vec<f64>, ProtocolError> {
    if count > MAX_VALUES {
        return Err(ProtocolError::TooManyValues {
            count,
            limit: MAX_VALUES,
        });
    }

    let mut raw = vec![0u8; count as usize * VALUE_LEN];
    reader.read_exact(&mut raw)?;

    let mut raw = &raw[..];
    Ok((0..count).map(|_| raw.get_f64_le()).collect())
}

fn read_frame_start<R: Read>(reader: &mut R, header: &mut [u8]) -> Result<bool, ProtocolError> {
    let mut filled = 0;
    while filled < header.len() {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => return Err(ProtocolError::Truncated),
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn request_frame_layout() {
        let mut buf = Vec::new();
        write_request(&mut buf, RequestId(7), &[1.0, -2.5]).unwrap();

        assert_eq!(buf.len(), REQUEST_HEADER_LEN + 2 * VALUE_LEN);
        assert_eq!(&buf[..8], &7u64.to_le_bytes());
        assert_eq!(&buf[8..12], &2u32.to_le_bytes());
        assert_eq!(&buf[12..20], &1.0f64.to_le_bytes());

        let frame = read_request(&mut Cursor::new(buf)).unwrap().unwrap();
        assert_eq!(frame.request_id, RequestId(7));
        assert_eq!(frame.params, vec![1.0, -2.5]);
    }

    #[test]
    fn clean_end_of_stream() {
        let mut empty = Cursor::new(Vec::new());
        assert_eq!(read_result(&mut empty).unwrap(), None);
    }

    #[test]
    fn truncated_header() {
        let mut buf = Vec::new();
        write_result(
            &mut buf,
            &ResultFrame::from_model_output(RequestId(1), Some(vec![3.0])),
        )
        .unwrap();
        buf.truncate(5);

        assert_eq!(
            read_result(&mut Cursor::new(buf)),
            Err(ProtocolError::Truncated)
        );
    }

    #[test]
    fn truncated_payload() {
        let mut buf = Vec::new();
        write_request(&mut buf, RequestId(1), &[1.0, 2.0]).unwrap();
        buf.pop();

        assert_eq!(
            read_request(&mut Cursor::new(buf)),
            Err(ProtocolError::Truncated)
        );
    }

    #[test]
    fn unknown_status() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u64.to_le_bytes());
        buf.push(9);
        buf.extend_from_slice(&0u32.to_le_bytes());

        assert_eq!(
            read_result(&mut Cursor::new(buf)),
            Err(ProtocolError::UnknownStatus(9))
        );
    }

    #[test]
    fn oversized_count() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u64.to_le_bytes());
        buf.extend_from_slice(&(MAX_VALUES + 1).to_le_bytes());

        assert_eq!(
            read_request(&mut Cursor::new(buf)),
            Err(ProtocolError::TooManyValues {
                count: MAX_VALUES + 1,
                limit: MAX_VALUES
            })
        );
    }

    #[test]
    fn oversized_request_is_not_encoded() {
        let params = vec![0.0; MAX_VALUES as usize + 1];
        let err = encode_request(RequestId(3), &params).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn serve_answers_every_request() {
        let mut input = Vec::new();
        write_request(&mut input, RequestId(1), &[1.0, 2.0]).unwrap();
        write_request(&mut input, RequestId(2), &[-1.0]).unwrap();

        let mut output = Vec::new();
        let num_served = serve(Cursor::new(input), &mut output, |params| {
            if params[0] < 0.0 {
                None
            } else {
                Some(params.iter().map(|x| x * 2.0).collect())
            }
        })
        .unwrap();
        assert_eq!(num_served, 2);

        let mut output = Cursor::new(output);
        let first = read_result(&mut output).unwrap().unwrap();
        assert_eq!(first.request_id, RequestId(1));
        assert_eq!(first.status, Status::Ok);
        assert_eq!(first.values, vec![2.0, 4.0]);

        let second = read_result(&mut output).unwrap().unwrap();
        assert_eq!(second.request_id, RequestId(2));
        assert_eq!(second.status, Status::Error);
        assert!(second.values.is_empty());

        assert_eq!(read_result(&mut output).unwrap(), None);
    }
}
