pub mod episodes;
pub mod fetcher;
pub mod progress;
pub mod transcriber;

pub use episodes::{EpisodeItem, EpisodeSearchBackend, FeedCandidate, SearchError};
pub use fetcher::{FetchBackend, FetchError, FetchOutcome, PacingHint, VideoMetadata};
pub use progress::{ProgressBus, ProgressEvent};
pub use transcriber::{TranscribeBackend, TranscribeError};
