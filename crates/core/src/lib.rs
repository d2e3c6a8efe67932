pub mod auth;
pub mod client;
pub mod error;
pub mod fallback;
pub mod loader;
pub mod media;
pub mod period;
pub mod protocol;
pub mod source;
pub mod transport;

pub use client::{ClientConfig, ClientEvent, ClientHandle, TransportMode};
pub use error::{ClientError, MediaError, Result, RtspError};
pub use fallback::FallbackPolicy;
pub use loader::{LoaderEvent, LoaderState, SampleStreamWrapper};
pub use media::{BufferedQueueAllocator, BufferedSampleQueue, DefaultExtractorFactory};
pub use period::{MediaPeriod, PeriodEvent, StreamHandle, TrackGroup};
pub use source::{RtspMediaSource, SourceEvent, Timeline};
