//! vhd-tool: CLI for Virtual Hard Disk images
//!
//! # Usage
//!
//! ```text
//! vhd-tool info <vhd>                              Footer, header & allocation summary
//! vhd-tool bat <vhd>                               List allocated table entries
//! vhd-tool cat <vhd> [start] [end]                 Raw disk contents to stdout
//! vhd-tool create <fixed|dynamic> <path> <size>    Create an empty image
//! ```
//!
//! Set `RUST_LOG=vhd=debug` to trace what the library does.

mod style;
mod cmd_info;
mod cmd_bat;
mod cmd_cat;
mod cmd_create;

use std::env;
use std::process;

use tracing_subscriber::EnvFilter;

use style::{RED, RESET, BOLD, DIM, GREEN};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let result = match args[1].as_str() {
        "info" => cmd_info::run(&args[2..]),
        "bat" => cmd_bat::run(&args[2..]),
        "cat" => cmd_cat::run(&args[2..]),
        "create" => cmd_create::run(&args[2..]),
        "-h" | "--help" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            eprintln!("{RED}Unknown command: {}{RESET}", args[1]);
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("{RED}error:{RESET} {e}");
        process::exit(1);
    }
}

fn print_usage() {
    eprintln!(
        r#"
{BOLD}vhd-tool{RESET}: Virtual Hard Disk inspector

{DIM}Fixed, dynamic and differencing VHD images{RESET}

{BOLD}USAGE:{RESET}
    vhd-tool <COMMAND> [OPTIONS]

{BOLD}COMMANDS:{RESET}
    {GREEN}info{RESET}      <vhd>                      Footer, header & allocation summary
    {GREEN}bat{RESET}       <vhd>                      List allocated table entries
    {GREEN}cat{RESET}       <vhd> [start] [end]        Raw disk contents to stdout
    {GREEN}create{RESET}    <fixed|dynamic> <path> <size>  Create an empty image

{BOLD}EXAMPLES:{RESET}
    vhd-tool info disk.vhd
    vhd-tool cat disk.vhd > disk.img
    vhd-tool cat disk.vhd 0 512 | xxd
    vhd-tool create dynamic scratch.vhd 4G

{DIM}Sizes and offsets accept K, M and G suffixes{RESET}
"#
    );
}
