//! Controller implementation for the ClusterGroupUpgrade CRD
//!
//! The dispatcher drives one CGU per wake-up: observe, decide the phase,
//! take the minimal actions to advance the plan, persist status, and return
//! a requeue hint.

mod upgrade;

pub use upgrade::{
    error_policy, reconcile, reconcile_cgu, run, Context, ContextBuilder, RequeueHint,
    CONTROLLER_NAME,
};
