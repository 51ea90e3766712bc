pub mod episode;
pub mod ident;

pub use episode::{EpisodeCandidate, EpisodeResolver, ResolutionMethod, Resolved};
pub use ident::canonicalize;
