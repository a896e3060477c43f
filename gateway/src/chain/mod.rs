//! # Chain Module
//!
//! Everything that follows the peers' best chain.
//!
//! ```text
//! builders.rs: fixture blocks and transactions (tests, `test-util`)
//! codec.rs  : streamed block decoding with size and merkle checks
//! status.rs : BlockParserStatus: live counters and derived averages
//! tracker.rs: BlockParser: queue, reorg resolution, row extraction
//! ```

#[cfg(any(test, feature = "test-util"))]
pub mod builders;
pub mod codec;
pub mod status;
pub mod tracker;

#[cfg(any(test, feature = "test-util"))]
pub use builders::{RawBlock, RawInput, RawOutput, RawTx};
pub use codec::{read_block, BlockHeader, CodecError, ParsedBlock, ParsedTx};
pub use status::{BlockParserStatus, BlockParserStatusSnapshot, ParsedBlockStats};
pub use tracker::{BlockOutcome, BlockParser, TrackerError};
