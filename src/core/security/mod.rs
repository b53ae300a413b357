// Copyright (c) 2026 Concordia
// Licensed under the Apache License, Version 2.0

//! Keystore and signature verification.

pub mod keystore;
