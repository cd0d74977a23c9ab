pub mod billing_events;
