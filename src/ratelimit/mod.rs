//! Admission control: key derivation, windowed counting, and decisions.

mod clock;
mod controller;
mod counter;
mod key;
mod policy;
mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use controller::{
    AdmissionConfig, AdmissionController, AdmissionResult, RateLimitHeaders, RejectionBody,
    SkipPredicate, DEFAULT_MESSAGE, REJECTION_ERROR,
};
pub use counter::CounterEntry;
pub use key::{
    ClientAddressKey, KeyDeriver, NamespacedKey, PathParamKey, RequestAttributes, UNKNOWN_KEY,
};
pub use policy::{KeyStrategy, PolicyConfig, PolicySet, TrustedAddresses, PUBLIC_ACCESS, PUBLIC_DOWNLOAD};
pub use store::{ReclaimStats, ReclamationGuard, WindowedCounterStore};
