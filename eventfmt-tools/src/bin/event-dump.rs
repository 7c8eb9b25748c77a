// SPDX-License-Identifier: Apache-2.0
//
// Copyright (C) 2024, ARM Limited and contributors.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may
// not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS, WITHOUT
// WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    error::Error,
    fs::File,
    io::{Read, Write},
    path::PathBuf,
    process::ExitCode,
};

use clap::{Args, Parser, Subcommand};
use eventfmt::{
    abi::{Endianness, LongSize},
    logging::LogLevel,
    session::Session,
};
use lib::{
    describe::describe_event,
    error::{MultiError, ToolError},
    print::print_record,
};
#[cfg(target_arch = "x86_64")]
use mimalloc::MiMalloc;

#[global_allocator]
#[cfg(target_arch = "x86_64")]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[arg(long, value_name = "ERRORS_JSON")]
    errors_json: Option<PathBuf>,

    /// Report the diagnostics of the decoder.
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

/// Where to read the event format from. Standard input is used if neither is given.
#[derive(Args)]
struct EventArgs {
    /// Event format text.
    #[arg(long, value_name = "FORMAT", conflicts_with = "file")]
    event: Option<String>,

    /// File containing the event format.
    #[arg(long, value_name = "PATH")]
    file: Option<PathBuf>,

    #[arg(long, value_name = "SYSTEM", default_value = "test")]
    system: String,
}

#[derive(Subcommand)]
enum Command {
    /// Parse an event format and print a summary of it.
    Parse {
        #[command(flatten)]
        event: EventArgs,
    },
    /// Render a binary record of the event.
    Print {
        #[command(flatten)]
        event: EventArgs,

        #[arg(long, value_name = "RECORD")]
        record: PathBuf,

        /// Size of the long type in bytes on the machine that produced the record.
        #[arg(long, value_name = "LONG_SIZE")]
        long_size: Option<usize>,

        #[arg(long)]
        big_endian: bool,

        /// Also print the content of each field.
        #[arg(long)]
        raw: bool,
    },
}

impl EventArgs {
    fn read_format(&self) -> Result<Vec<u8>, ToolError> {
        Ok(match (&self.event, &self.file) {
            (Some(event), _) => event.clone().into_bytes(),
            (None, Some(path)) => std::fs::read(path)?,
            (None, None) => {
                let mut buf = Vec::new();
                std::io::stdin().lock().read_to_end(&mut buf)?;
                buf
            }
        })
    }
}

fn run(command: Command, verbose: bool) -> Result<(), MultiError<ToolError>> {
    let stdout = std::io::stdout().lock();
    let mut out = std::io::BufWriter::new(stdout);

    let mut session = Session::default();
    if verbose {
        session.set_log_level(LogLevel::All);
    }

    let res = match command {
        Command::Parse { event } => {
            session.set_log_level(LogLevel::All);
            let format = event.read_format()?;
            let id = session.register_event(format, &event.system)?;
            match session.event(id) {
                Some(desc) => describe_event(&session, desc, &mut out),
                None => Ok(()),
            }
        }
        Command::Print {
            event,
            record,
            long_size,
            big_endian,
            raw,
        } => {
            let long_size = long_size
                .map(|size| LongSize::try_from(size).map_err(ToolError::InvalidLongSize))
                .transpose()?;
            let endianness = match big_endian {
                true => Endianness::Big,
                false => Endianness::Little,
            };
            session.set_endianness(endianness);
            session.set_long_size(long_size);
            log::info!("decoding with {endianness} and long size {long_size:?}");

            let format = event.read_format()?;
            session.register_event(format, &event.system)?;
            let record = std::fs::read(record).map_err(ToolError::from)?;
            print_record(&session, &record, raw, &mut out)
        }
    };
    out.flush()?;
    res
}

fn _main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "info" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    let res = run(cli.command, cli.verbose);

    if let Err(err) = &res {
        eprintln!("Errors happened while processing the event:\n{err}");
    }

    if let Some(path) = &cli.errors_json {
        let json_value = match &res {
            Err(err) => err.to_json(),
            Ok(_) => MultiError::<ToolError>::default().to_json(),
        };
        let mut file = File::create(path)?;
        file.write_all(json_value.to_string().as_bytes())?;
    }

    match res {
        Ok(_) => Ok(()),
        Err(err) => match err.errors().into_iter().next() {
            Some(ToolError::FormatError(_)) => Err("Failed to parse event".into()),
            _ => Err("Errors happened".into()),
        },
    }
}

fn main() -> ExitCode {
    match _main() {
        Err(err) => {
            eprintln!("{err}");
            ExitCode::from(1)
        }
        Ok(_) => ExitCode::from(0),
    }
}
