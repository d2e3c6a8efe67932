use std::fmt;
use std::str::FromStr;

use crate::error::{ParseErrorKind, RtspError};

/// RTSP methods (RFC 2326 §10).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Method {
    Announce,
    Describe,
    GetParameter,
    Options,
    Pause,
    Play,
    Record,
    Redirect,
    Setup,
    SetParameter,
    Teardown,
}

impl Method {
    pub const ALL: [Method; 11] = [
        Method::Announce,
        Method::Describe,
        Method::GetParameter,
        Method::Options,
        Method::Pause,
        Method::Play,
        Method::Record,
        Method::Redirect,
        Method::Setup,
        Method::SetParameter,
        Method::Teardown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Announce => "ANNOUNCE",
            Self::Describe => "DESCRIBE",
            Self::GetParameter => "GET_PARAMETER",
            Self::Options => "OPTIONS",
            Self::Pause => "PAUSE",
            Self::Play => "PLAY",
            Self::Record => "RECORD",
            Self::Redirect => "REDIRECT",
            Self::Setup => "SETUP",
            Self::SetParameter => "SET_PARAMETER",
            Self::Teardown => "TEARDOWN",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = RtspError;

    /// Method names are case-sensitive (RFC 2326 §6.1).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Method::ALL
            .into_iter()
            .find(|method| method.as_str() == s)
            .ok_or(RtspError::parse(ParseErrorKind::InvalidRequestLine))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_known_methods() {
        assert_eq!("GET_PARAMETER".parse::<Method>().unwrap(), Method::GetParameter);
        assert_eq!("TEARDOWN".parse::<Method>().unwrap(), Method::Teardown);
    }

    #[test]
    fn method_names_are_case_sensitive() {
        assert!("play".parse::<Method>().is_err());
        assert!("GET".parse::<Method>().is_err());
    }
}
