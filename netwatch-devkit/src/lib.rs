/*!
# Netwatch DevKit - test doubles for the kernel

Lets the health pipeline be exercised without a broker or real devices:
- `RecordingPublisher`: records status-changed notifications
- `InstrumentedChecker`: fake probe that measures its own concurrency
- `RecordingStore`: device registry wrapper that records every update
- `fixtures`: bus payloads shaped like the ones real detectors send
*/

pub mod fake_probe;
pub mod fixtures;
pub mod mock_bus;
pub mod recording_store;

pub use fake_probe::InstrumentedChecker;
pub use mock_bus::{PublishedMessage, RecordingPublisher};
pub use recording_store::RecordingStore;
