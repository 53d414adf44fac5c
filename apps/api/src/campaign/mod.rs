pub mod acquisition;
pub mod check_in;
pub mod escalation;
pub mod estimator;
pub mod handlers;
pub mod ledger;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod pg_ledger;
pub mod retry;
pub mod scheduler;
pub mod urgency;
