// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Built-in service modules.

mod logger;

pub use logger::LoggerModule;
