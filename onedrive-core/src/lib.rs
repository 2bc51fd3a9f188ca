mod client;
mod connectivity;
mod error;
mod oauth;
mod resource;
mod session;
mod transport;

pub use client::{DriveClient, remote_path};
pub use connectivity::{ConnectivityMonitor, DEFAULT_PROBE_URL, DEFAULT_RETRY_DELAY};
pub use error::{ApiErrorClass, DriveError};
pub use oauth::{OAuthClient, OAuthError, OAuthToken};
pub use resource::{
    AsyncCopySession, AsyncOperationStatus, ByteRange, ConflictBehavior, Drive, DriveItem,
    FileFacet, FileSystemInfo, FolderFacet, Hashes, ItemLocator, ItemPage, ItemPatch,
    ItemReference, Quota, UploadProgress, UploadSession, format_timestamp, parse_timestamp,
};
pub use session::{OAuthState, TokenProvider, TokenProviderError};
pub use transport::{CallOptions, DEFAULT_RETRY_AFTER, RetryingTransport, retry_after};
