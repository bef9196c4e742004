//! hsrv response types

use bytes::{BufMut, BytesMut};

/// Line terminator written after every response
pub const LINE_TERMINATOR: &[u8] = b"\r\n";

/// A response line
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// OK
    Ok,

    /// NOT OK
    NotOk,

    /// NOT SUPPORTED
    NotSupported,

    /// OK <bitstring>
    Query(String),

    /// OK <count> <algorithm> hashes, load <l1> <l2> <l3>
    Status {
        count: usize,
        algorithm: &'static str,
        load: [f64; 3],
    },
}

impl Response {
    pub fn ok() -> Self {
        Response::Ok
    }

    pub fn not_ok() -> Self {
        Response::NotOk
    }

    pub fn not_supported() -> Self {
        Response::NotSupported
    }

    /// One `1`/`0` per looked-up digest, in order
    pub fn query(hits: impl IntoIterator<Item = bool>) -> Self {
        Response::Query(hits.into_iter().map(|hit| if hit { '1' } else { '0' }).collect())
    }

    pub fn status(count: usize, algorithm: &'static str, load: [f64; 3]) -> Self {
        Response::Status {
            count,
            algorithm,
            load,
        }
    }

    /// Render the line without its terminator
    pub fn to_line(&self) -> String {
        match self {
            Response::Ok => "OK".to_string(),
            Response::NotOk => "NOT OK".to_string(),
            Response::NotSupported => "NOT SUPPORTED".to_string(),
            Response::Query(bits) if bits.is_empty() => "OK".to_string(),
            Response::Query(bits) => format!("OK {}", bits),
            Response::Status {
                count,
                algorithm,
                load,
            } => format!(
                "OK {} {} hashes, load {:.2} {:.2} {:.2}",
                count, algorithm, load[0], load[1], load[2]
            ),
        }
    }

    /// Encode the response to bytes
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf
    }

    /// Encode the response into an existing buffer
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_slice(self.to_line().as_bytes());
        buf.put_slice(LINE_TERMINATOR);
    }
}
