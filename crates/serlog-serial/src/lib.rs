//! # SerLog – Serial Session Engine
//!
//! Engine core of an interactive serial monitor:
//!
//! - **Transport** – async wrapper over an OS serial port, plus an in-memory
//!   simulated port for tests and demos
//! - **Framing** – incremental text decoding with carry-over, or fixed-width
//!   hex groups with stream offsets
//! - **Reader Loop** – background task turning received bytes into render units
//! - **Write Dispatcher** – terminator handling and serialized writes
//! - **Command History** – bounded recall buffer with cursor navigation
//! - **Session Log** – timestamped, append-only capture of both directions
//! - **Output Hub** – ordered fan-out to any number of consumers

pub mod serial;
