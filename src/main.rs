//! Interactive shell over a mounted FAT32 image.
//!
//! One positional argument names the image file. The file is opened
//! read+write, wrapped in the engine's block-device trait and mounted; the
//! loop then reads commands, dispatches them to the [`Volume`] and prints
//! results until `exit` or end of input. No command error ends the loop.

use std::fs::OpenOptions;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Arg, Command};
use log::{Level, LevelFilter, Log, Metadata, Record};
use spin::RwLock;

use fat32_edit::device::{BlockDevice, DeviceError};
use fat32_edit::file::Mode;
use fat32_edit::volume::Volume;

/// Positional image I/O over the opened file.
struct ImageFile(RwLock<std::fs::File>);

impl BlockDevice for ImageFile {
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<(), DeviceError> {
        let mut file = self.0.write();
        file.seek(SeekFrom::Start(offset as u64))
            .map_err(|_| DeviceError::ReadError)?;
        file.read_exact(buf).map_err(|_| DeviceError::ReadError)
    }

    fn write_at(&self, offset: usize, buf: &[u8]) -> Result<(), DeviceError> {
        let mut file = self.0.write();
        file.seek(SeekFrom::Start(offset as u64))
            .map_err(|_| DeviceError::WriteError)?;
        file.write_all(buf).map_err(|_| DeviceError::WriteError)
    }

    fn size(&self) -> usize {
        self.0
            .read()
            .metadata()
            .map(|meta| meta.len() as usize)
            .unwrap_or(0)
    }
}

struct SimpleLogger;

static LOGGER: SimpleLogger = SimpleLogger;

impl Log for SimpleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Trace
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{:>5}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

/// Engine diagnostics stay off unless RUST_LOG asks for them, so they never
/// interleave with shell output.
fn logging_init() {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(match std::env::var("RUST_LOG").as_deref() {
        Ok("ERROR") | Ok("error") => LevelFilter::Error,
        Ok("WARN") | Ok("warn") => LevelFilter::Warn,
        Ok("INFO") | Ok("info") => LevelFilter::Info,
        Ok("DEBUG") | Ok("debug") => LevelFilter::Debug,
        Ok("TRACE") | Ok("trace") => LevelFilter::Trace,
        _ => LevelFilter::Off,
    });
}

/// One shell token. `quoted` marks a double-quoted string, delivered with the
/// quotes stripped and interior whitespace preserved.
#[derive(Debug, PartialEq, Eq)]
struct Token {
    text: String,
    quoted: bool,
}

fn tokenize(line: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '"' {
            chars.next();
            let mut text = String::new();
            loop {
                match chars.next() {
                    Some('"') => break,
                    Some(ch) => text.push(ch),
                    None => return Err(String::from("unterminated quoted string")),
                }
            }
            tokens.push(Token { text, quoted: true });
        } else {
            let mut text = String::new();
            while let Some(&ch) = chars.peek() {
                if ch.is_whitespace() || ch == '"' {
                    break;
                }
                text.push(ch);
                chars.next();
            }
            tokens.push(Token { text, quoted: false });
        }
    }
    Ok(tokens)
}

fn one_arg<'a>(tokens: &'a [Token], usage: &str) -> Result<&'a str, String> {
    match tokens.get(1) {
        Some(token) if !token.quoted => Ok(token.text.as_str()),
        _ => Err(format!("usage: {usage}")),
    }
}

fn two_args<'a>(tokens: &'a [Token], usage: &str) -> Result<(&'a str, &'a str), String> {
    match (tokens.get(1), tokens.get(2)) {
        (Some(a), Some(b)) if !a.quoted && !b.quoted => Ok((a.text.as_str(), b.text.as_str())),
        _ => Err(format!("usage: {usage}")),
    }
}

fn show(err: fat32_edit::Error) -> String {
    err.to_string()
}

fn print_info(volume: &Volume) {
    let info = volume.info();
    println!("Root cluster: {}", info.root_cluster);
    println!("Bytes per sector: {}", info.bytes_per_sector);
    println!("Sectors per cluster: {}", info.sectors_per_cluster);
    println!("Total clusters in data region: {}", info.data_clusters);
    println!("# of entries in one FAT: {}", info.entries_per_fat);
    println!("Size of image (bytes): {}", info.image_bytes);
}

fn dispatch(volume: &mut Volume, tokens: &[Token]) -> Result<(), String> {
    match tokens[0].text.as_str() {
        "info" => {
            print_info(volume);
            Ok(())
        }
        "ls" => {
            for name in volume.list().map_err(show)? {
                println!("{name}");
            }
            Ok(())
        }
        "cd" => volume.change_dir(one_arg(tokens, "cd DIR")?).map_err(show),
        "creat" => volume
            .create_file(one_arg(tokens, "creat FILE")?)
            .map_err(show),
        "mkdir" => volume.make_dir(one_arg(tokens, "mkdir DIR")?).map_err(show),
        "open" => {
            let (name, flag) = two_args(tokens, "open FILE {-r|-w|-rw|-wr}")?;
            let mode = Mode::from_flag(flag).ok_or_else(|| String::from("bad mode"))?;
            volume.open_file(name, mode).map_err(show)
        }
        "close" => volume
            .close_file(one_arg(tokens, "close FILE")?)
            .map_err(show),
        "lsof" => {
            for (index, row) in volume.open_table().iter() {
                println!(
                    "index: {} | name: {} | cluster: {} | mode: {} | offset: {} | path: {}",
                    index,
                    row.name_str(),
                    row.first_cluster,
                    row.mode,
                    row.offset,
                    row.path
                );
            }
            Ok(())
        }
        "lseek" => {
            let (name, offset) = two_args(tokens, "lseek FILE OFFSET")?;
            let offset: u32 = offset.parse().map_err(|_| String::from("bad offset"))?;
            volume.seek(name, offset).map_err(show)
        }
        "write" => match (tokens.get(1), tokens.get(2)) {
            (Some(name), Some(data)) if !name.quoted && data.quoted => volume
                .write_file(&name.text, data.text.as_bytes())
                .map(|_| ())
                .map_err(show),
            _ => Err(String::from("usage: write FILE \"STRING\"")),
        },
        "read" => {
            let (name, len) = two_args(tokens, "read FILE SIZE")?;
            let len: usize = len.parse().map_err(|_| String::from("bad size"))?;
            let data = volume.read_file(name, len).map_err(show)?;
            println!("{}", String::from_utf8_lossy(&data));
            Ok(())
        }
        "mv" => {
            let (src, dst) = two_args(tokens, "mv SRC DST")?;
            volume.rename(src, dst).map_err(show)
        }
        "rm" => volume.remove_file(one_arg(tokens, "rm FILE")?).map_err(show),
        "rmdir" => volume
            .remove_dir(one_arg(tokens, "rmdir DIR")?)
            .map_err(show),
        _ => Err(String::from("not a valid command")),
    }
}

fn main() -> ExitCode {
    logging_init();

    let command = Command::new("fat32-edit")
        .about("Interactive FAT32 image editor")
        .arg(
            Arg::new("image")
                .value_name("IMAGE")
                .required(true)
                .help("FAT32 image file to mount"),
        );
    let matches = match command.try_get_matches() {
        Ok(matches) => matches,
        Err(err) => {
            let _ = err.print();
            return ExitCode::from(1);
        }
    };
    let Some(image) = matches.get_one::<String>("image") else {
        return ExitCode::from(1);
    };

    let file = match OpenOptions::new().read(true).write(true).open(image) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("Error: {}: {err}", DeviceError::NotFound);
            return ExitCode::from(1);
        }
    };
    let device = Arc::new(ImageFile(RwLock::new(file)));
    let mut volume = match Volume::mount(device, image) {
        Ok(volume) => volume,
        Err(err) => {
            eprintln!("Error: {err}");
            return ExitCode::from(1);
        }
    };

    let stdin = io::stdin();
    loop {
        print!("{}{}> ", volume.image_name(), volume.current_path());
        let _ = io::stdout().flush();

        let mut line = String::new();
        match stdin.read_line(&mut line) {
            Ok(0) => {
                println!();
                break;
            }
            Ok(_) => {}
            Err(err) => {
                eprintln!("Error: {err}");
                break;
            }
        }

        let tokens = match tokenize(&line) {
            Ok(tokens) => tokens,
            Err(msg) => {
                println!("Error: {msg}");
                continue;
            }
        };
        if tokens.is_empty() {
            continue;
        }
        if tokens[0].text == "exit" && !tokens[0].quoted {
            break;
        }

        if let Err(msg) = dispatch(&mut volume, &tokens) {
            println!("Error: {msg}");
        }
    }

    ExitCode::SUCCESS
}
