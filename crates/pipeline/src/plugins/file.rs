//! File input and output plugins, the chain defaults.
//!
//! `file -` reads standard input / writes standard output; anything
//! else is a path. The input validates sync bytes so a desynchronized
//! source fails loudly instead of feeding garbage downstream.

use crate::data::PacketMetadata;
use crate::error::{PipelineError, PipelineResult, PluginError, PluginResult};
use crate::plugin::{InputPlugin, OutputPlugin, Plugin, PluginContext};
use crate::report::StageReport;
use clap::{Arg, ArgAction, Command};
use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Read, Write};
use std::path::PathBuf;
use ts_types::{TsPacket, PKT_SIZE};

const STDIO_PATH: &str = "-";

fn input_command() -> Command {
    Command::new("file")
        .no_binary_name(true)
        .about("Read a transport stream from a file or standard input")
        .arg(
            Arg::new("file")
                .value_parser(clap::value_parser!(PathBuf))
                .default_value(STDIO_PATH)
                .help("Input file, '-' for standard input"),
        )
}

fn output_command() -> Command {
    Command::new("file")
        .no_binary_name(true)
        .about("Write the transport stream to a file or standard output")
        .arg(
            Arg::new("file")
                .value_parser(clap::value_parser!(PathBuf))
                .default_value(STDIO_PATH)
                .help("Output file, '-' for standard output"),
        )
        .arg(
            Arg::new("append")
                .long("append")
                .action(ArgAction::SetTrue)
                .help("Append to the output file instead of truncating it"),
        )
}

/// Factory for the built-in file input.
pub fn file_input(args: &[String], ctx: PluginContext) -> PipelineResult<Box<dyn InputPlugin>> {
    let matches = input_command()
        .try_get_matches_from(args)
        .map_err(|e| PipelineError::Config(format!("file input: {e}")))?;
    let path = matches
        .get_one::<PathBuf>("file")
        .cloned()
        .unwrap_or_else(|| PathBuf::from(STDIO_PATH));
    Ok(Box::new(FileInput {
        path,
        reader: None,
        packets_read: 0,
        report: ctx.report,
    }))
}

/// Factory for the built-in file output.
pub fn file_output(args: &[String], _ctx: PluginContext) -> PipelineResult<Box<dyn OutputPlugin>> {
    let matches = output_command()
        .try_get_matches_from(args)
        .map_err(|e| PipelineError::Config(format!("file output: {e}")))?;
    let path = matches
        .get_one::<PathBuf>("file")
        .cloned()
        .unwrap_or_else(|| PathBuf::from(STDIO_PATH));
    Ok(Box::new(FileOutput {
        path,
        append: matches.get_flag("append"),
        writer: None,
    }))
}

enum ReadStatus {
    Complete,
    Eof,
    Truncated,
}

pub struct FileInput {
    path: PathBuf,
    reader: Option<Box<dyn Read + Send>>,
    packets_read: u64,
    report: StageReport,
}

impl FileInput {
    fn is_stdin(&self) -> bool {
        self.path.as_os_str() == STDIO_PATH
    }

    fn read_packet(reader: &mut dyn Read, pkt: &mut TsPacket) -> PluginResult<ReadStatus> {
        let buf = pkt.bytes_mut();
        let mut off = 0;
        while off < PKT_SIZE {
            match reader.read(&mut buf[off..]) {
                Ok(0) => {
                    return Ok(if off == 0 {
                        ReadStatus::Eof
                    } else {
                        ReadStatus::Truncated
                    })
                }
                Ok(n) => off += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(ReadStatus::Complete)
    }
}

impl Plugin for FileInput {
    fn start(&mut self) -> PluginResult<()> {
        let reader: Box<dyn Read + Send> = if self.is_stdin() {
            Box::new(io::stdin())
        } else {
            Box::new(File::open(&self.path)?)
        };
        self.reader = Some(reader);
        self.packets_read = 0;
        Ok(())
    }

    fn stop(&mut self) -> PluginResult<()> {
        self.reader = None;
        Ok(())
    }
}

impl InputPlugin for FileInput {
    fn receive(
        &mut self,
        packets: &mut [TsPacket],
        _metadata: &mut [PacketMetadata],
    ) -> PluginResult<usize> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| PluginError::Message("input not started".into()))?;
        let mut count = 0;
        for pkt in packets.iter_mut() {
            match Self::read_packet(reader.as_mut(), pkt)? {
                ReadStatus::Complete => {
                    if !pkt.has_sync() {
                        return Err(PluginError::Message(format!(
                            "synchronization lost at packet {}",
                            self.packets_read + count as u64
                        )));
                    }
                    count += 1;
                }
                ReadStatus::Eof => break,
                ReadStatus::Truncated => {
                    self.report.warning("truncated trailing packet discarded");
                    break;
                }
            }
        }
        self.packets_read += count as u64;
        Ok(count)
    }
}

pub struct FileOutput {
    path: PathBuf,
    append: bool,
    writer: Option<Box<dyn Write + Send>>,
}

impl FileOutput {
    fn is_stdout(&self) -> bool {
        self.path.as_os_str() == STDIO_PATH
    }
}

impl Plugin for FileOutput {
    fn start(&mut self) -> PluginResult<()> {
        let writer: Box<dyn Write + Send> = if self.is_stdout() {
            Box::new(io::stdout())
        } else {
            Box::new(
                OpenOptions::new()
                    .write(true)
                    .create(true)
                    .append(self.append)
                    .truncate(!self.append)
                    .open(&self.path)?,
            )
        };
        self.writer = Some(writer);
        Ok(())
    }

    fn stop(&mut self) -> PluginResult<()> {
        if let Some(w) = self.writer.as_mut() {
            w.flush()?;
        }
        self.writer = None;
        Ok(())
    }
}

impl OutputPlugin for FileOutput {
    fn send(&mut self, packets: &[TsPacket], _metadata: &[PacketMetadata]) -> PluginResult<bool> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| PluginError::Message("output not started".into()))?;
        writer.write_all(bytemuck::cast_slice(packets))?;
        Ok(true)
    }
}
