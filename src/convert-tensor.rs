// Copyright 2019-present, Laurent Mazare.
// Copyright 2019-present Guillaume Becquin
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

use std::path::PathBuf;

use clap::Parser;
use tracing::info;

/// Converts a numpy `.npz` weight archive into a libtorch `.ot` file
#[derive(Parser, Debug)]
#[command(name = "convert-tensor", version)]
struct Args {
    /// Source `.npz` archive
    source: PathBuf,
    /// Destination `.ot` file
    destination: PathBuf,
    /// Cast floating point weights to half precision
    #[arg(long)]
    half: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let mut tensors = tch::Tensor::read_npz(&args.source)?;
    if args.half {
        tensors = tensors
            .into_iter()
            .map(|(name, tensor)| {
                let tensor = if tensor.is_floating_point() {
                    tensor.to_kind(tch::Kind::Half)
                } else {
                    tensor
                };
                (name, tensor)
            })
            .collect();
    }
    tch::Tensor::save_multi(&tensors, &args.destination)?;
    info!(
        tensors = tensors.len(),
        source = %args.source.display(),
        destination = %args.destination.display(),
        "converted weights"
    );
    Ok(())
}
