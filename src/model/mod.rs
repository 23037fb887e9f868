pub mod agent;
pub mod gating;
pub mod idle_engine;
pub mod idle_state;
pub mod sliding_window;
pub mod state_store;
pub mod suspend_executor;
