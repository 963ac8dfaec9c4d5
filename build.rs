/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

use std::fs;
use std::path::Path;

fn main() {
    let src = Path::new("./resource/config.yaml");
    println!("cargo:rerun-if-changed={}", src.display());

    // `target/<profile>/build/<hash>/out` -> `target/<profile>/`
    let Ok(out_dir) = std::env::var("OUT_DIR") else {
        return;
    };
    let Some(target_dir) = Path::new(&out_dir)
        .ancestors()
        .nth(3)
    else {
        return;
    };

    // Ship a sample configuration next to the binary; a missing sample is not fatal
    if src.exists() {
        if let Err(e) = fs::copy(src, target_dir.join("config.yaml")) {
            println!("cargo:warning=failed to copy sample config.yaml: {e}");
        }
    }
}
