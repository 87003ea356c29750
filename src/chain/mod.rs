pub mod abi;
pub mod bank;
pub mod oracle;
pub mod poller;
pub mod registry;
pub mod rpc;
pub mod signer;
pub mod tx;
pub mod venue;

pub use bank::{MockTransferAdapter, TransferPort};
pub use oracle::{MockOracleAdapter, OraclePort};
pub use poller::{LedgerPoller, MockLedgerPoller};
pub use registry::{MockRegistryAdapter, RegistryPort};
pub use venue::{MockSwapVenue, SwapVenue};
