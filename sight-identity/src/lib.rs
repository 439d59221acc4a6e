//! Node identity for sight relays: the durable Ed25519 keypair kept in
//! `device-keypair.json` and the DID derived from its public key.
//!
//! # Quickstart
//! ```
//! use sight_identity::{Did, KeypairStore};
//!
//! let dir = std::env::temp_dir().join(format!("sight-doc-{}", std::process::id()));
//! let store = KeypairStore::new(dir.join("device-keypair.json"));
//! let first = store.load_or_create().unwrap();
//! let again = store.load_or_create().unwrap();
//! assert_eq!(first.public_key, again.public_key);
//! assert!(again.did(false).as_str().starts_with("did:sight:hoster:"));
//! assert_eq!(again.did(true), Did::gateway());
//! # std::fs::remove_dir_all(dir).ok();
//! ```

pub mod did;
pub mod keypair;
pub mod store;

pub use did::{Did, DID_PREFIX, ED25519_MULTICODEC, GATEWAY_DID};
pub use keypair::{KeyError, Keypair};
pub use store::{keypair_dir, KeyStoreError, KeypairStore, KEYPAIR_FILE};
