//! Human-readable listings of loaded IREP trees.
//!
//! Each IREP prints its header counts, the names of its locals, one line
//! per instruction with symbol, pool and jump operands resolved, and its
//! catch table. Children follow their parent, indented.

use std::fmt::{self, Write};

use bytecode::{CatchKind, Instruction, Role, decode_at};

use crate::irep::{Irep, PoolEntry};

/// Render `irep` and everything below it.
pub fn disassemble(irep: &Irep) -> String {
    let mut out = String::new();
    // Writing to a String cannot fail.
    let _ = write_irep(&mut out, irep, &mut vec![]);
    out
}

/// Write the listing of `irep`; `path` holds the child indices leading to
/// it from the root.
pub fn write_irep(out: &mut impl Write, irep: &Irep, path: &mut Vec<usize>) -> fmt::Result {
    let pad = "  ".repeat(path.len());
    let name = match path.is_empty() {
        true => "irep".to_string(),
        false => format!(
            "irep {}",
            path.iter().map(usize::to_string).collect::<Vec<_>>().join(".")
        ),
    };
    writeln!(
        out,
        "{pad}{name} nregs={} nlocals={} pools={} syms={} reps={} ilen={}",
        irep.nregs(),
        irep.nlocals(),
        irep.plen(),
        irep.slen(),
        irep.rlen(),
        irep.ilen()
    )?;

    let locals: Vec<String> = (1..irep.nlocals())
        .filter_map(|reg| irep.local_name(reg).map(|s| format!("r{reg}:{s}")))
        .collect();
    if !locals.is_empty() {
        writeln!(out, "{pad}local variable names: {}", locals.join(" "))?;
    }

    let code = irep.code();
    let mut pc = 0;
    while pc < code.len() {
        let (insn, next) = match decode_at(code, pc) {
            Ok(decoded) => decoded,
            Err(err) => {
                writeln!(out, "{pad}  !! {err}")?;
                break;
            }
        };
        write!(out, "{pad}  {pc:04} {insn}")?;
        let notes = annotate(irep, next, &insn);
        if !notes.is_empty() {
            write!(out, "\t; {}", notes.join(", "))?;
        }
        writeln!(out)?;
        pc = next;
    }

    for h in irep.catch_handlers() {
        let kind = match h.kind {
            CatchKind::Rescue => "rescue",
            CatchKind::Ensure => "ensure",
        };
        writeln!(
            out,
            "{pad}  catch {kind} {:04}..{:04} -> {:04}",
            h.begin, h.end, h.target
        )?;
    }

    for (n, child) in irep.children().iter().enumerate() {
        path.push(n);
        write_irep(out, child, path)?;
        path.pop();
    }
    Ok(())
}

/// Resolved meanings of the operands of `insn`, which ends at `next`.
fn annotate(irep: &Irep, next: usize, insn: &Instruction) -> Vec<String> {
    let mut notes = Vec::new();
    for (n, role) in insn.op.roles().iter().enumerate() {
        let v = insn.operand(n) as usize;
        match role {
            Role::Reg => {
                if let Some(name) = (v < irep.nlocals()).then(|| irep.local_name(v)).flatten() {
                    notes.push(format!("r{v}={name}"));
                }
            }
            Role::Sym if v < irep.slen() => notes.push(format!(":{}", irep.symbol(v))),
            Role::Pool if v < irep.plen() => notes.push(pool_note(irep.pool_entry(v))),
            Role::Irep if v < irep.rlen() => notes.push(format!("irep {v}")),
            Role::Jump => {
                let target = next as isize + insn.operand(n) as u16 as i16 as isize;
                notes.push(format!("-> {target:04}"));
            }
            _ => {}
        }
    }
    notes
}

fn pool_note(entry: PoolEntry<'_>) -> String {
    match entry {
        PoolEntry::Str(bytes) => format!("{:?}", String::from_utf8_lossy(bytes)),
        PoolEntry::Int(i) => i.to_string(),
        PoolEntry::Float(f) => crate::value::format_float(f),
        PoolEntry::BigInt {
            negative,
            base,
            digits,
        } => format!(
            "{}{} (base {base})",
            if negative { "-" } else { "" },
            String::from_utf8_lossy(digits)
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytecode::{BytecodeBuilder, CatchHandler, ImageWriter, IrepDesc, PoolLiteral};

    #[test]
    fn listing_resolves_operands() {
        let mut desc = IrepDesc::new(2, 4, Vec::new());
        desc.local_names = vec![Some("x".into())];
        let greeting = desc.add_pool(PoolLiteral::str("hi"));
        let puts = desc.sym("puts");
        let mut b = BytecodeBuilder::new();
        b.load_int(1, 3);
        let skip = b.jump_if(1);
        b.load_self(2);
        b.string(3, greeting);
        b.send(2, puts, 1);
        b.bind(skip);
        b.ret(1);
        desc.code = b.into_bytes();
        desc.catch_handlers.push(CatchHandler {
            kind: CatchKind::Rescue,
            begin: 0,
            end: 2,
            target: 2,
        });
        desc.add_child(IrepDesc::new(1, 2, vec![bytecode::Op::Stop as u8]));

        let irep = crate::load(ImageWriter::new().write(&desc)).expect("load");
        let text = disassemble(&irep);
        assert!(text.starts_with("irep nregs=4 nlocals=2 pools=1 syms=1 reps=1"));
        assert!(text.contains("local variable names: r1:x"));
        assert!(text.contains("r1=x"));
        assert!(text.contains("\"hi\""));
        assert!(text.contains(":puts"));
        assert!(text.contains("catch rescue 0000..0002 -> 0002"));
        assert!(text.contains("  irep 0 nregs=2"));
        assert!(text.contains("STOP"));
    }
}
