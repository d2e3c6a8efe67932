//! Request construction for each client method.

use crate::protocol::{Header, Method, Range, Request, Transport};

/// Media type requested by DESCRIBE.
pub const SDP_MIME_TYPE: &str = "application/sdp";

/// Per-request values the builder takes from the session.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext<'a> {
    /// Presentation URL without userinfo.
    pub url: &'a str,
    /// Aggregate control URL for PLAY/PAUSE.
    pub play_url: &'a str,
    pub session_id: Option<&'a str>,
    pub user_agent: &'a str,
    pub cseq: u32,
}

impl RequestContext<'_> {
    fn request(&self, method: Method, url: &str) -> Request {
        let mut request =
            Request::new(method, url).with_header(Header::UserAgent, self.user_agent);
        request.set_cseq(self.cseq);
        request
    }

    fn with_session(&self, request: Request) -> Request {
        match self.session_id {
            Some(id) => request.with_header(Header::Session, id),
            None => request,
        }
    }
}

/// Builds the requests the session issues. The session supplies the CSeq
/// and identifiers; a builder only decides the wire shape.
pub trait MethodBuilder: Send {
    fn options(&self, ctx: &RequestContext<'_>) -> Request;

    fn describe(&self, ctx: &RequestContext<'_>) -> Request;

    /// SETUP for the track at `url`.
    fn setup(&self, ctx: &RequestContext<'_>, url: &str, transport: &Transport) -> Request;

    fn play(&self, ctx: &RequestContext<'_>, range: Option<Range>, scale: Option<f32>) -> Request;

    fn pause(&self, ctx: &RequestContext<'_>) -> Request;

    fn get_parameter(&self, ctx: &RequestContext<'_>) -> Request;

    fn teardown(&self, ctx: &RequestContext<'_>) -> Request;
}

/// The stock request shapes.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultMethodBuilder;

impl MethodBuilder for DefaultMethodBuilder {
    fn options(&self, ctx: &RequestContext<'_>) -> Request {
        ctx.with_session(ctx.request(Method::Options, ctx.url))
    }

    fn describe(&self, ctx: &RequestContext<'_>) -> Request {
        ctx.request(Method::Describe, ctx.url)
            .with_header(Header::Accept, SDP_MIME_TYPE)
    }

    fn setup(&self, ctx: &RequestContext<'_>, url: &str, transport: &Transport) -> Request {
        ctx.with_session(ctx.request(Method::Setup, url))
            .with_header(Header::Transport, transport.to_string())
    }

    fn play(&self, ctx: &RequestContext<'_>, range: Option<Range>, scale: Option<f32>) -> Request {
        let mut request = ctx.with_session(ctx.request(Method::Play, ctx.play_url));
        if let Some(range) = range {
            request = request.with_header(Header::Range, range.to_string());
        }
        if let Some(scale) = scale {
            request = request.with_header(Header::Scale, format!("{scale:.1}"));
        }
        request
    }

    fn pause(&self, ctx: &RequestContext<'_>) -> Request {
        ctx.with_session(ctx.request(Method::Pause, ctx.play_url))
    }

    fn get_parameter(&self, ctx: &RequestContext<'_>) -> Request {
        ctx.with_session(ctx.request(Method::GetParameter, ctx.url))
    }

    fn teardown(&self, ctx: &RequestContext<'_>) -> Request {
        ctx.with_session(ctx.request(Method::Teardown, ctx.url))
    }
}
