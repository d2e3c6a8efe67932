//! RTSP protocol implementation (RFC 2326), client side.
//!
//! This module handles the wire format: request/response messages, header
//! values with structure of their own (`Transport`, `Range`), SDP bodies, and
//! the framed reader that separates RTSP text from interleaved binary data.
//!
//! ## RTSP message format (RFC 2326 §4)
//!
//! RTSP messages follow HTTP/1.1 syntax with a different method set:
//!
//! ```text
//! DESCRIBE rtsp://server/stream RTSP/1.0\r\n
//! CSeq: 2\r\n
//! Accept: application/sdp\r\n
//! \r\n
//! ```
//!
//! Key differences from HTTP:
//! - Stateful: sessions persist across requests (RFC 2326 §3).
//! - Either side may send requests; the server may ANNOUNCE or probe with
//!   GET_PARAMETER on the same connection.
//! - Binary media may be interleaved on the control connection (§10.12).
//!
//! ## Methods issued by the client
//!
//! | Method | RFC section | Purpose |
//! |--------|-------------|---------|
//! | OPTIONS | §10.1 | Capability discovery, keep-alive fallback |
//! | DESCRIBE | §10.2 | Retrieve SDP session description |
//! | SETUP | §10.4 | Negotiate transport per track |
//! | PLAY | §10.5 | Start or reposition media delivery |
//! | PAUSE | §10.6 | Suspend media delivery |
//! | TEARDOWN | §10.7 | Destroy session |
//! | GET_PARAMETER | §10.8 | Keep-alive |

pub mod header;
pub mod message;
pub mod method;
pub mod range;
pub mod reader;
pub mod request;
pub mod response;
pub mod sdp;
pub mod transport;

pub use header::{Header, Headers};
pub use message::{InterleavedFrame, MediaType, Message, MessageBody, RTSP_VERSION};
pub use method::Method;
pub use range::Range;
pub use reader::{Frame, FrameDecoder, FramedReader};
pub use request::Request;
pub use response::{Response, status};
pub use sdp::SessionDescription;
pub use transport::{LowerTransport, Transport};
