//! ActivityPub federation
//!
//! Handles:
//! - Inbound verification (HTTP signatures, LD signatures)
//! - Activity handling (inbox)
//! - Followers collection synchronization
//! - Outbound distribution and delivery
//! - Poll expiry notifications

mod activity;
pub mod builder;
pub mod collection_sync;
mod delivery;
mod distribution;
pub(crate) mod key_resolver;
pub mod ld_signature;
mod poll_expiry;
pub mod signature;
pub mod tag_manager;
mod verifier;

pub use activity::{ActivityProcessor, ActivityType};
pub use collection_sync::{CollectionSynchronizer, SyncDecision};
pub use delivery::{DeliveryOutcome, DeliveryWorker, backoff_delay, classify_status};
pub use distribution::{DeliveryInputs, Distributor, InboxTarget, plan_recipients, plan_status_delivery};
pub use key_resolver::{
    CacheStats, HttpActorFetcher, KeyResolver, RemoteActorDocument, RemoteActorFetcher,
};
pub use poll_expiry::PollExpirationNotifier;
pub use signature::{parse_signature_header, sign_request, verify_signature};
pub use tag_manager::{TagManager, authority_of};
pub use verifier::SignatureVerifier;
