// build.rs

use clap::{Arg, ArgAction, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

fn build_cli() -> Command {
    Command::new("virtshift")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Convert virtual machine images from foreign hypervisors to run on KVM")
        .arg(
            Arg::new("input")
                .short('i')
                .long("input")
                .value_name("MODE")
                .default_value("disk")
                .help("Input mode (disk)"),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .value_name("MODE")
                .default_value("local")
                .help("Output mode (local, null)"),
        )
        .arg(
            Arg::new("output-storage")
                .long("output-storage")
                .value_name("DIR")
                .help("Output storage directory (local output mode)"),
        )
        .arg(
            Arg::new("output-format")
                .long("output-format")
                .value_name("FORMAT")
                .help("Output disk format (raw or qcow2)"),
        )
        .arg(
            Arg::new("output-alloc")
                .long("output-alloc")
                .value_name("MODE")
                .help("Output allocation mode (sparse or preallocated)"),
        )
        .arg(
            Arg::new("name")
                .short('n')
                .long("name")
                .value_name("NAME")
                .help("Rename the guest on the target"),
        )
        .arg(
            Arg::new("network-map")
                .long("network-map")
                .value_name("IN:OUT")
                .action(ArgAction::Append)
                .help("Map a source network name to a target network name"),
        )
        .arg(
            Arg::new("key")
                .long("key")
                .value_name("DEVICE:FILE")
                .action(ArgAction::Append)
                .help("Passphrase file for an encrypted device"),
        )
        .arg(
            Arg::new("in-place")
                .long("in-place")
                .action(ArgAction::SetTrue)
                .help("Convert the source guest in place instead of copying"),
        )
        .arg(
            Arg::new("compressed")
                .long("compressed")
                .action(ArgAction::SetTrue)
                .help("Compress the copied disks (qcow2 only)"),
        )
        .arg(
            Arg::new("print-source")
                .long("print-source")
                .action(ArgAction::SetTrue)
                .help("Print the source description and exit"),
        )
        .arg(
            Arg::new("print-estimate")
                .long("print-estimate")
                .action(ArgAction::SetTrue)
                .help("Estimate the target disk space and exit"),
        )
        .arg(
            Arg::new("machine-readable")
                .long("machine-readable")
                .action(ArgAction::SetTrue)
                .help("Produce machine-readable output"),
        )
        .arg(
            Arg::new("args")
                .value_name("ARG")
                .action(ArgAction::Append)
                .help("Input arguments (disk image paths in disk input mode)"),
        )
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // Create man directory - use CARGO_MANIFEST_DIR which is always set by cargo
    let manifest_dir = match env::var("CARGO_MANIFEST_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(e) => {
            println!("cargo:warning=CARGO_MANIFEST_DIR not set: {}", e);
            return;
        }
    };
    let man_dir = manifest_dir.join("man");

    if let Err(e) = fs::create_dir_all(&man_dir) {
        println!("cargo:warning=Failed to create man directory: {}", e);
        return;
    }

    let cmd = build_cli();
    let man = Man::new(cmd);
    let mut buffer = Vec::new();

    if let Err(e) = man.render(&mut buffer) {
        println!("cargo:warning=Failed to render man page: {}", e);
        return;
    }

    let man_path = man_dir.join("virtshift.1");
    if let Err(e) = fs::write(&man_path, buffer) {
        println!("cargo:warning=Failed to write man page: {}", e);
        return;
    }

    println!("cargo:warning=Man page generated at {}", man_path.display());
}
