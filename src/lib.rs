//! JSON HTTP adapter in front of the Glasir timetable site.
//!
//! The upstream only speaks form-posted ASP endpoints returning HTML; this
//! crate reconstructs a session from caller-supplied cookies, scrapes the
//! timetable and homework pages concurrently, and serves the result as a
//! stable JSON API.

pub mod routes;
pub mod timetable_engine;
