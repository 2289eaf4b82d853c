//! Human-readable listing of a command stream.

use core::fmt::Write;

use super::CommandTable;
use crate::cmd_list::CommandStream;
use crate::protocol::cmds::AnyCommand;
use crate::tile::TILE_COUNT;

/// Bands a command touches, `*` for drawn and `-` for culled.
fn cull_pattern(mask: Option<u16>) -> String {
    (0..TILE_COUNT)
        .map(|t| match mask {
            Some(m) if m & (1 << t) == 0 => '-',
            _ => '*',
        })
        .collect()
}

/// One line per command: index, id, name, size, bands, decoded fields.
pub fn dump(stream: CommandStream<'_>, table: &CommandTable) -> String {
    let mut out = String::new();
    let mut iter = stream.iter();
    for cmd in iter.by_ref() {
        let id = cmd.header.cmd;
        let name = table.name(id).unwrap_or_else(|| "?".to_string());
        let mask = cmd.header.has_cull_mask().then_some(cmd.header.cull_tile_mask);
        let fields = match AnyCommand::decode(cmd.bytes) {
            Ok((_, decoded)) => decoded.to_string(),
            Err(e) => format!("<{e}>"),
        };
        let _ = writeln!(
            out,
            "{:4} {:3} {:<24} {:5} [{}] {}",
            cmd.index,
            id,
            name,
            cmd.header.size,
            cull_pattern(mask),
            fields
        );
    }
    if let Some(corruption) = iter.corruption() {
        let _ = writeln!(out, "stream corrupt after {} commands: {:?}", iter.visited(), corruption);
    } else if iter.visited() != stream.count {
        let _ = writeln!(out, "expected {} commands, found {}", stream.count, iter.visited());
    }
    out
}
