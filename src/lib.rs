// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Intercepting HTTP proxy that enriches captured JavaScript and HTML.
//!
//! Responses worth analysing are sent to the jswzl analysis service along
//! with their source map, and the chunk files it reports are fetched through
//! the proxy so they get captured and analysed in turn.

pub mod analysis;
pub mod ca;
pub mod capture;
pub mod classify;
pub mod config;
pub mod connector;
pub mod dispatch;
pub mod flow;
pub mod headers;
pub mod orchestrator;
pub mod pending;
pub mod pipeline;
pub mod proxy;
pub mod registry;
pub mod replay;
pub mod resolver;
pub mod snapshot;

#[cfg(test)]
pub mod test_helpers;
