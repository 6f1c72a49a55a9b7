use std::env::set_var;
use std::io::{self, BufRead, Write};

use anyhow::Result;
use clap::{arg, command, ArgAction};
use log::*;

use vsfs::desc::{utc_time, ImmutablePolicy, SnapshotGranularity, WriteStrategy};
use vsfs::disk_driver::cache::CacheDiskDriver;
use vsfs::disk_driver::file::FileDiskDriver;
use vsfs::disk_driver::DiskDriver;
use vsfs::prv;
use vsfs::utils::init_logs;
use vsfs::VSFS;

fn main() -> Result<()> {
    let matches = command!() // requires `cargo` feature
        .arg(arg!([device] "Backing image file").default_value("vsfs.img"))
        .arg(arg!(-b --blocks <N> "Total data blocks")
            .required(false)
            .default_value("1000"))
        .arg(arg!(-i --inodes <N> "Total inodes")
            .required(false)
            .default_value("100"))
        .arg(arg!(--format "Format the volume before use").action(ArgAction::SetTrue)
            .required(false))
        .arg(arg!(--cached "Route device IO through the LRU block cache").action(ArgAction::SetTrue)
            .required(false))
        .arg(arg!(-v --verbose "Print more debug information, or set `RUST_LOG=debug`").action(ArgAction::SetTrue)
            .required(false))
        .get_matches();

    if matches.get_flag("verbose") {
        set_var("RUST_LOG", "debug");
    }
    init_logs();
    let device = matches.get_one::<String>("device").unwrap();
    let blocks = matches.get_one::<String>("blocks").unwrap().parse::<u32>()?;
    let inodes = matches.get_one::<String>("inodes").unwrap().parse::<u32>()?;
    info!("Device: {}", device);

    let force_format = matches.get_flag("format");
    if matches.get_flag("cached") {
        bring_up(CacheDiskDriver::new(FileDiskDriver::new()), device, blocks, inodes, force_format)
    } else {
        bring_up(FileDiskDriver::new(), device, blocks, inodes, force_format)
    }
}

fn bring_up<T: DiskDriver>(
    driver: T,
    device: &str,
    blocks: u32,
    inodes: u32,
    force_format: bool,
) -> Result<()> {
    let mut fs = VSFS::create(driver, blocks, inodes, device)?;
    fs.vsfs_init(device, force_format)?;

    let stdin = io::stdin();
    print!("vsfs> ");
    io::stdout().flush()?;
    for line in stdin.lock().lines() {
        let line = line?;
        match run_command(&mut fs, &line) {
            Ok(true) => break,
            Ok(false) => {}
            Err(e) => println!("error: {}", e),
        }
        print!("vsfs> ");
        io::stdout().flush()?;
    }
    fs.vsfs_destroy()?;
    Ok(())
}

fn parse_policy(word: &str) -> Option<ImmutablePolicy> {
    match word {
        "none" => Some(ImmutablePolicy::None),
        "readonly" | "ro" => Some(ImmutablePolicy::ReadOnly),
        "appendonly" | "ao" => Some(ImmutablePolicy::AppendOnly),
        "worm" => Some(ImmutablePolicy::Worm),
        _ => None,
    }
}

fn parse_strategy(word: &str) -> WriteStrategy {
    match word {
        "row" => WriteStrategy::Row,
        _ => WriteStrategy::Cow,
    }
}

/// One line, one engine operation. Returns `Ok(true)` to quit.
fn run_command<T: DiskDriver>(fs: &mut VSFS<T>, line: &str) -> Result<bool> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let rest = |n: usize| {
        if n >= words.len() {
            String::new()
        } else {
            words[n..].join(" ")
        }
    };
    match words.first().copied() {
        None => {}
        Some("help") => {
            println!("commands:");
            println!("  stat | metrics | ls | snaps | save | format | dedupscan | quit");
            println!("  create <name> [none|ro|ao|worm]");
            println!("  write <name> [cow|row] <text...>");
            println!("  read <name>   append <name> <text...>   delete <name>");
            println!("  truncate <name> <bytes>   policy <name> <none|ro|ao|worm>");
            println!("  xattr <name> <key> [value]");
            println!("  version <name> [description...]   versions <name>");
            println!("  vrollback <name> <version-id>   vtag <name> <version-id> <tag>");
            println!("  snap <name> [description...]   restore <snapshot-name>");
            println!("  strim <snapshot-name>   sdelete <snapshot-name>");
            println!("  granularity <fine|medium|coarse>");
        }
        Some("quit") | Some("exit") => return Ok(true),
        Some("stat") => {
            fs.print_stats();
            println!(
                "logical {} B, physical {} B, dedup ratio {:.3}",
                fs.storage_usage(),
                fs.actual_usage(),
                fs.dedup_ratio()
            );
        }
        Some("metrics") => {
            println!("{:#?}", fs.get_metrics());
            prv!(fs.dedup_savings());
        }
        Some("ls") => {
            for inode in fs.list_files() {
                println!(
                    "[{}] {} {} B, {} blocks, {} versions, policy {:?}",
                    inode.inode_id,
                    inode.filename,
                    inode.size,
                    inode.blocks.len(),
                    inode.versions.len(),
                    inode.immutable_policy
                );
            }
        }
        Some("create") => {
            let name = words.get(1).copied().unwrap_or_default();
            let policy = words
                .get(2)
                .and_then(|w| parse_policy(w))
                .unwrap_or(ImmutablePolicy::None);
            let ino = fs.create_file(name, policy)?;
            println!("created '{}' as inode {}", name, ino);
        }
        Some("write") => {
            let name = words.get(1).copied().unwrap_or_default();
            let (strategy, text) = match words.get(2).copied() {
                Some("cow") | Some("row") => (parse_strategy(words[2]), rest(3)),
                _ => (fs.default_strategy, rest(2)),
            };
            let size = fs.write_file(name, text.as_bytes(), strategy)?;
            println!("size now {} B", size);
        }
        Some("read") => {
            let ino = fs.lookup_file(words.get(1).copied().unwrap_or_default())?;
            let data = fs.read_file(ino)?;
            println!("{}", String::from_utf8_lossy(&data));
        }
        Some("append") => {
            let ino = fs.lookup_file(words.get(1).copied().unwrap_or_default())?;
            let size = fs.append_file(ino, rest(2).as_bytes())?;
            println!("size now {} B", size);
        }
        Some("delete") => {
            let ino = fs.lookup_file(words.get(1).copied().unwrap_or_default())?;
            fs.delete_file(ino)?;
            println!("deleted");
        }
        Some("truncate") => {
            let ino = fs.lookup_file(words.get(1).copied().unwrap_or_default())?;
            let size = words.get(2).copied().unwrap_or("0").parse::<u64>()?;
            fs.truncate_file(ino, size)?;
            println!("size now {} B", size);
        }
        Some("policy") => {
            let ino = fs.lookup_file(words.get(1).copied().unwrap_or_default())?;
            match words.get(2).and_then(|w| parse_policy(w)) {
                Some(policy) => {
                    fs.set_immutable_policy(ino, policy)?;
                    println!("policy set to {:?}", policy);
                }
                None => println!("usage: policy <name> <none|ro|ao|worm>"),
            }
        }
        Some("xattr") => {
            let ino = fs.lookup_file(words.get(1).copied().unwrap_or_default())?;
            let key = words.get(2).copied().unwrap_or_default();
            match words.get(3) {
                Some(_) => {
                    fs.set_extended_attribute(ino, key, &rest(3))?;
                    println!("attribute set");
                }
                None => match fs.get_extended_attribute(ino, key)? {
                    Some(value) => println!("{} = {}", key, value),
                    None => println!("{} is unset", key),
                },
            }
        }
        Some("version") => {
            let ino = fs.lookup_file(words.get(1).copied().unwrap_or_default())?;
            let vid = fs.create_version(ino, &rest(2))?;
            println!("version {} created", vid);
        }
        Some("versions") => {
            let ino = fs.lookup_file(words.get(1).copied().unwrap_or_default())?;
            for version in fs.list_versions(ino)? {
                println!(
                    "v{} [{}] parent {} size {} B, {} blocks, {} tags: {}",
                    version.version_id,
                    utc_time(version.created_at).format("%Y-%m-%d %H:%M:%S"),
                    version.parent_version,
                    version.size,
                    version.blocks.len(),
                    version.tags.len(),
                    version.description
                );
            }
        }
        Some("vrollback") => {
            let ino = fs.lookup_file(words.get(1).copied().unwrap_or_default())?;
            let vid = words.get(2).copied().unwrap_or("0").parse::<u32>()?;
            fs.rollback_version(ino, vid)?;
            println!("rolled back to version {}", vid);
        }
        Some("vtag") => {
            let ino = fs.lookup_file(words.get(1).copied().unwrap_or_default())?;
            let vid = words.get(2).copied().unwrap_or("0").parse::<u32>()?;
            let tag = words.get(3).copied().unwrap_or_default();
            fs.add_version_tag(ino, vid, tag, &rest(4))?;
            println!("tagged v{} with '{}'", vid, tag);
        }
        Some("snap") => {
            let name = words.get(1).copied().unwrap_or_default();
            let id = fs.create_snapshot(name, &rest(2))?;
            println!("snapshot '{}' created as id {}", name, id);
        }
        Some("snaps") => {
            for snap in fs.list_snapshots() {
                println!(
                    "[{}] {} ({}) {} B across {} files{}{}",
                    snap.snapshot_id,
                    snap.name,
                    utc_time(snap.created_at).format("%Y-%m-%d %H:%M:%S"),
                    snap.total_size,
                    snap.captured.len(),
                    if snap.is_trimmed { ", trimmed" } else { "" },
                    if snap.group_name.is_empty() {
                        String::new()
                    } else {
                        format!(", group '{}'", snap.group_name)
                    }
                );
            }
        }
        Some("restore") => {
            let id = fs.lookup_snapshot(words.get(1).copied().unwrap_or_default())?;
            fs.rollback_snapshot(id)?;
            println!("restored snapshot {}", id);
        }
        Some("strim") => {
            let id = fs.lookup_snapshot(words.get(1).copied().unwrap_or_default())?;
            fs.trim_snapshot(id)?;
            println!("snapshot {} trimmed", id);
        }
        Some("sdelete") => {
            let id = fs.lookup_snapshot(words.get(1).copied().unwrap_or_default())?;
            fs.delete_snapshot(id)?;
            println!("snapshot {} deleted", id);
        }
        Some("granularity") => match words.get(1).copied() {
            Some("fine") => fs.adjust_granularity(SnapshotGranularity::Fine),
            Some("medium") => fs.adjust_granularity(SnapshotGranularity::Medium),
            Some("coarse") => fs.adjust_granularity(SnapshotGranularity::Coarse),
            _ => println!("usage: granularity <fine|medium|coarse>"),
        },
        Some("dedupscan") => {
            fs.scan_and_deduplicate();
        }
        Some("save") => {
            fs.save()?;
        }
        Some("format") => {
            fs.format();
        }
        Some(other) => {
            println!("unknown command '{}', try `help`", other);
        }
    }
    Ok(false)
}
