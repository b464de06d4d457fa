pub mod controller;
pub mod events;
pub mod period;
pub mod query;
pub mod types;
pub mod volume_types;

pub use controller::{EntityController, Transition};
pub use events::{LifecycleEvent, VolumeSpec};
pub use period::{
    validate_sequence, Attributes, InstanceAttributes, OsAttributes, SequenceViolation,
    UsagePeriod, VolumeAttributes,
};
pub use query::{ActivePeriod, Clock, FixedClock, QueryService, SystemClock};
pub use types::{EntityId, EntityType, LastEvent, PeriodKey, TenantId};
pub use volume_types::{VolumeType, VolumeTypeResolver};
