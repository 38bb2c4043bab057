// Copyright 2023 Laurent Mazare
// https://github.com/LaurentMazare/diffusers-rs/blob/main/build.rs
// Copyright 2024 The mt5-translator Authors
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::env;

fn main() {
    println!("cargo:rerun-if-env-changed=DEP_TCH_LIBTORCH_LIB");
    let os = env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    let libtorch_lib = env::var_os("DEP_TCH_LIBTORCH_LIB");
    match os.as_str() {
        "linux" | "windows" => {
            if let Some(lib_path) = &libtorch_lib {
                println!(
                    "cargo:rustc-link-arg=-Wl,-rpath={}",
                    lib_path.to_string_lossy()
                );
            }
            // keeps libtorch_cuda linked so that CUDA devices are visible at runtime
            println!("cargo:rustc-link-arg=-Wl,--no-as-needed");
            println!("cargo:rustc-link-arg=-Wl,--copy-dt-needed-entries");
            println!("cargo:rustc-link-arg=-ltorch");
        }
        "macos" => {
            if let Some(lib_path) = &libtorch_lib {
                println!(
                    "cargo:rustc-link-arg=-Wl,-rpath,{}",
                    lib_path.to_string_lossy()
                );
            }
        }
        _ => {}
    }
}
