//! Answer document matching.
//!
//! Binds uploaded answer documents to roster students by the text they
//! contain, creating outsider records for documents nobody on the roster
//! claims.

pub mod matcher;
pub mod roster;

pub use matcher::{find_roster_match, DocumentMatcher, MatcherConfig};
pub use roster::{ensure_roster, initialize_job};
