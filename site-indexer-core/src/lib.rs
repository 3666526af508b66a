#![doc = "site-indexer-core: core logic library for site-indexer."]

//! This crate keeps a site's search index in sync with the site's pages. It reads the site
//! structure and page documents from the content repository, resolves the content items the
//! pages reference, turns every page into an index record, and creates, updates, deletes and
//! publishes the index items so they match.
//!
//! All repository traffic goes through a short-lived [`proxy::LocalAuthProxy`] that owns the
//! credentials and the CSRF token. The authenticated HTTP client itself is supplied by the
//! caller through [`contract::RemoteContentClient`].
//!
//! # Usage
//! Call [`synchronise::run_index_site`] with a client, the remote routes and an
//! [`config::IndexRequest`], or drive [`synchronise::synchronise`] against any
//! [`contract::SiteRepository`].

pub mod config;
pub mod context;
pub mod contract;
pub mod diff;
pub mod download;
pub mod error;
pub mod keywords;
pub mod proxy;
pub mod publish;
pub mod record;
pub mod repository;
pub mod resolve;
pub mod site;
pub mod structure;
pub mod synchronise;
