//! Scenario tests driving the pipeline runner with real child processes

mod helpers;

mod concurrency;
mod history;
mod sqlite_store;
mod store_failures;
mod success_chain;
