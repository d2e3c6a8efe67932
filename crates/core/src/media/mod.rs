//! Media model and the sample path.
//!
//! [`describe`] turns the SDP of a DESCRIBE response into [`MediaTrack`]s.
//! [`extractor`] is the boundary the stream loaders write through, with a
//! default RTP payload extractor. [`queue`] holds an in-memory sample queue
//! for callers without a playback engine of their own.

pub mod describe;
pub mod extractor;
pub mod queue;
pub mod rtp;
pub mod track;

pub use describe::{SessionInfo, TrackFilter, describe_tracks};
pub use extractor::{
    DefaultExtractorFactory, Extractor, ExtractorFactory, ExtractorInput, ExtractorOutput, Format,
    ReadResult, SampleQueue, SampleQueueAllocator, TIME_END_OF_SOURCE, TIME_UNSET, TrackOutput,
};
pub use queue::{BufferedQueueAllocator, BufferedSampleQueue, Sample};
pub use track::{MediaFormat, MediaTrack, PayloadFormat, TrackType};
