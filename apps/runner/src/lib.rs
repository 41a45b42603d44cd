// SPDX-FileCopyrightText: © 2025 BatchKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! `bkit`: runs the batching engine against synthetic streams.

pub mod cli;
pub mod config;
pub mod logging;
pub mod sim;
