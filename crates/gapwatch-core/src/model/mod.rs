pub mod record;

pub use record::{
    CompletenessRecord, CompletenessStatus, CompletenessValue, GlobalRecord, GlobalTotals,
    RecomputeParams, TicketRef,
};
