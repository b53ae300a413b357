// Copyright (c) 2026 Concordia
// Licensed under the Apache License, Version 2.0

//! The external VM execution boundary.

pub mod executor;
