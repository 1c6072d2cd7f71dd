//! Vigil - out-of-band interaction capture and correlation
//!
//! Hands out unique subdomains ("zones") under operator-controlled domains,
//! listens on DNS, SMTP and HTTP(S) for probes against them, answers with
//! canned or rule-scripted responses, and records every interaction for
//! later correlation through a management REST API.

pub mod access;
pub mod api;
pub mod app;
pub mod catalog;
pub mod config;
pub mod error;
pub mod identity;
pub mod listener;
pub mod models;
pub mod recorder;
pub mod registry;
pub mod rules;
pub mod storage;
