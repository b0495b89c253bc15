// SPDX-License-Identifier: MIT

pub mod config;
pub mod sdk;
pub mod steps;
pub mod workflow;
