use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::process;

use clap::{App, AppSettings, Arg, SubCommand};

use d64img::disk::backup::{BackupSession, Overwrite, OverwritePolicy};
use d64img::disk::{DiskError, FileType, D64};
use d64img::util;
use d64img::Petscii;

// Possible exit codes
static _EXIT_SUCCESS: i32 = 0;
static EXIT_FAILURE: i32 = 1;

static DEFAULT_DISK_NAME: &str = "new disk";
static DEFAULT_DISK_ID: &str = "01";

fn main() {
    env_logger::init();

    // Parse command-line arguments
    let app = App::new("Commodore 1541 Disk Image Utility")
        .version("0.1.0")
        .about("Read, write, verify, and repair D64 disk images.")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(Arg::with_name("diskimage").required(true))
        .subcommand(
            SubCommand::with_name("create")
                .about("Create and format a blank disk image.")
                .arg(
                    Arg::with_name("tracks")
                        .long("tracks")
                        .takes_value(true)
                        .possible_values(&["35", "40"])
                        .default_value("35")
                        .help("Number of tracks"),
                )
                .arg(
                    Arg::with_name("name")
                        .long("name")
                        .takes_value(true)
                        .help("Disk name"),
                ),
        )
        .subcommand(
            SubCommand::with_name("format")
                .about("Format a disk image")
                .arg(Arg::with_name("name").required(true))
                .arg(Arg::with_name("id").required(false)),
        )
        .subcommand(
            SubCommand::with_name("dir")
                .about("Show a directory listing")
                .alias("list"),
        )
        .subcommand(
            SubCommand::with_name("add")
                .about("Add a host file to the disk image.")
                .arg(Arg::with_name("source_filename").required(true)),
        )
        .subcommand(
            SubCommand::with_name("addrel")
                .about("Add a host file as a relative (REL) file.")
                .arg(
                    Arg::with_name("record-size")
                        .long("record-size")
                        .takes_value(true)
                        .required(true)
                        .help("REL record size (2-254)"),
                )
                .arg(Arg::with_name("source_filename").required(true)),
        )
        .subcommand(
            SubCommand::with_name("extract")
                .about("Extract a file to the host filesystem.")
                .arg(Arg::with_name("filename").required(true))
                .arg(Arg::with_name("destination_filename").required(false)),
        )
        .subcommand(
            SubCommand::with_name("remove")
                .about("Remove (scratch) a file.")
                .alias("del")
                .arg(Arg::with_name("filename").required(true)),
        )
        .subcommand(
            SubCommand::with_name("rename")
                .about("Rename a file.")
                .arg(Arg::with_name("original_filename").required(true))
                .arg(Arg::with_name("new_filename").required(true)),
        )
        .subcommand(
            SubCommand::with_name("rename-disk")
                .about("Rename the disk.")
                .arg(Arg::with_name("new_name").required(true)),
        )
        .subcommand(
            SubCommand::with_name("lock")
                .about("Lock a file.")
                .arg(Arg::with_name("filename").required(true)),
        )
        .subcommand(
            SubCommand::with_name("unlock")
                .about("Unlock a file.")
                .arg(Arg::with_name("filename").required(true)),
        )
        .subcommand(SubCommand::with_name("bam").about("Show the Block Availability Map (BAM)"))
        .subcommand(
            SubCommand::with_name("dump")
                .about("Hex dump one sector.")
                .arg(
                    Arg::with_name("track")
                        .validator(track_validator)
                        .required(true),
                )
                .arg(
                    Arg::with_name("sector")
                        .validator(sector_validator)
                        .required(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("verify")
                .about("Verify BAM integrity against every sector chain.")
                .arg(
                    Arg::with_name("fix")
                        .long("fix")
                        .help("Automatically repair inconsistencies"),
                ),
        )
        .subcommand(SubCommand::with_name("compact").about("Pack the directory entries."))
        .subcommand(
            SubCommand::with_name("reorder")
                .about("Reorder the directory entries.")
                .arg(Arg::with_name("order").multiple(true))
                .arg(
                    Arg::with_name("orderfile")
                        .long("orderfile")
                        .takes_value(true)
                        .help("Read the name order from a file, one name per line"),
                ),
        )
        .subcommand(
            SubCommand::with_name("backup")
                .about("Back up the files of one or more disks onto this image.")
                .arg(
                    Arg::with_name("disks")
                        .long("disks")
                        .takes_value(true)
                        .multiple(true)
                        .required(true)
                        .help("Source disk images"),
                ),
        )
        .subcommand(SubCommand::with_name("shell").about("Interactive shell mode."));

    let mut app_clone = app.clone();
    let matches = app.get_matches();

    let diskimage = matches.value_of("diskimage").unwrap();
    let result = match matches.subcommand() {
        ("create", Some(m)) => cmd_create(
            diskimage,
            m.value_of("tracks").unwrap().parse::<u8>().unwrap(),
            m.value_of("name"),
        ),
        ("format", Some(m)) => with_disk(diskimage, true, |disk| {
            disk.format(
                &m.value_of("name").unwrap().into(),
                &m.value_of("id").unwrap_or(DEFAULT_DISK_ID).into(),
            )?;
            println!("Formatted disk: {}", diskimage);
            Ok(())
        }),
        ("dir", Some(_)) => with_disk(diskimage, false, op_dir),
        ("add", Some(m)) => {
            let source = m.value_of("source_filename").unwrap();
            with_disk(diskimage, true, |disk| op_add(disk, source))
        }
        ("addrel", Some(m)) => {
            let source = m.value_of("source_filename").unwrap();
            let record_size = m.value_of("record-size").unwrap();
            with_disk(diskimage, true, |disk| op_addrel(disk, source, record_size))
        }
        ("extract", Some(m)) => {
            let filename = m.value_of("filename").unwrap();
            let destination = m.value_of("destination_filename");
            with_disk(diskimage, false, |disk| op_extract(disk, filename, destination))
        }
        ("remove", Some(m)) => {
            let filename = m.value_of("filename").unwrap();
            with_disk(diskimage, true, |disk| op_remove(disk, filename))
        }
        ("rename", Some(m)) => {
            let original = m.value_of("original_filename").unwrap();
            let new = m.value_of("new_filename").unwrap();
            with_disk(diskimage, true, |disk| op_rename(disk, original, new))
        }
        ("rename-disk", Some(m)) => {
            let new_name = m.value_of("new_name").unwrap();
            with_disk(diskimage, true, |disk| op_rename_disk(disk, new_name))
        }
        ("lock", Some(m)) => {
            let filename = m.value_of("filename").unwrap();
            with_disk(diskimage, true, |disk| op_lock(disk, filename, true))
        }
        ("unlock", Some(m)) => {
            let filename = m.value_of("filename").unwrap();
            with_disk(diskimage, true, |disk| op_lock(disk, filename, false))
        }
        ("bam", Some(_)) => with_disk(diskimage, false, op_bam),
        ("dump", Some(m)) => {
            let track = m.value_of("track").unwrap().parse::<u8>().unwrap();
            let sector = m.value_of("sector").unwrap().parse::<u8>().unwrap();
            with_disk(diskimage, false, |disk| op_dump(disk, track, sector))
        }
        ("verify", Some(m)) => {
            let fix = m.is_present("fix");
            with_disk(diskimage, fix, |disk| op_verify(disk, fix))
        }
        ("compact", Some(_)) => with_disk(diskimage, true, |disk| {
            disk.compact_directory()?;
            println!("Compacted directory.");
            Ok(())
        }),
        ("reorder", Some(m)) => {
            let mut order: Vec<String> = m
                .values_of("order")
                .map(|v| v.map(|s| s.to_string()).collect())
                .unwrap_or_default();
            if let Some(orderfile) = m.value_of("orderfile") {
                match fs::read_to_string(orderfile) {
                    Ok(contents) => {
                        order.extend(contents.lines().map(|l| l.trim().to_string()));
                    }
                    Err(e) => {
                        eprintln!("Error: cannot read {}: {}", orderfile, e);
                        process::exit(EXIT_FAILURE);
                    }
                }
            }
            with_disk(diskimage, true, |disk| op_reorder(disk, &order))
        }
        ("backup", Some(m)) => {
            let disks: Vec<String> = m
                .values_of("disks")
                .unwrap()
                .map(|s| s.to_string())
                .collect();
            cmd_backup(diskimage, &disks)
        }
        ("shell", Some(_)) => {
            shell(Some(diskimage));
            Ok(())
        }
        _ => {
            app_clone.print_help().unwrap();
            println!();
            process::exit(EXIT_FAILURE);
        }
    };
    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(EXIT_FAILURE);
    }
}

fn u8_validator(v: String, min: u8, max: u8) -> Result<(), String> {
    match v.parse::<u8>() {
        Ok(n) if n >= min && n <= max => Ok(()),
        _ => Err(format!("Expected a value from {}-{}.", min, max)),
    }
}

/// Require a track argument to be a number in the range 1-40.
fn track_validator(v: String) -> Result<(), String> {
    u8_validator(v, 1, 40)
}

/// Require a sector argument to be a number in the range 0-20.
fn sector_validator(v: String) -> Result<(), String> {
    u8_validator(v, 0, 20)
}

/// Open a disk image, run one operation against it, and (for writable
/// access) flush the result back out.
fn with_disk<F>(path: &str, writable: bool, f: F) -> io::Result<()>
where
    F: FnOnce(&mut D64) -> io::Result<()>,
{
    let mut disk = D64::open(path, writable)?;
    f(&mut disk)?;
    if writable {
        disk.save()?;
    }
    Ok(())
}

/// Derive the CBM filename and host extension from a host path: basename,
/// uppercased, split at the last dot.
fn host_stem_and_ext(path: &str) -> (Petscii, Option<String>) {
    let base = Path::new(path)
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or(path);
    match base.rfind('.') {
        Some(i) if i > 0 => (
            Petscii::from_str(&base[..i]),
            Some(base[i + 1..].to_uppercase()),
        ),
        _ => (Petscii::from_str(base), None),
    }
}

fn cmd_create(diskimage: &str, tracks: u8, name: Option<&str>) -> io::Result<()> {
    let mut disk = D64::create(diskimage, tracks)?;
    let name = name.unwrap_or(DEFAULT_DISK_NAME);
    disk.format(&name.into(), &DEFAULT_DISK_ID.into())?;
    disk.save()?;
    println!("Created new disk: {}", diskimage);
    Ok(())
}

fn op_dir(disk: &mut D64) -> io::Result<()> {
    println!("{}", disk);
    for entry in disk.iter() {
        println!("{}", entry?);
    }
    println!("{} blocks free.", disk.free_sector_count());
    Ok(())
}

fn op_add(disk: &mut D64, source_filename: &str) -> io::Result<()> {
    let data = fs::read(source_filename)?;
    let (name, ext) = host_stem_and_ext(source_filename);
    let file_type = match ext.as_deref() {
        Some("PRG") => FileType::PRG,
        Some("SEQ") => FileType::SEQ,
        Some("USR") => FileType::USR,
        Some("REL") => FileType::REL, // rejected by the engine with UseAddRel
        _ => {
            eprintln!("Unknown file type. Using PRG.");
            FileType::PRG
        }
    };

    disk.add_file(&name, file_type, &data)?;
    println!("Added file: {} to {}", source_filename, disk.disk_name());
    Ok(())
}

fn op_addrel(disk: &mut D64, source_filename: &str, record_size: &str) -> io::Result<()> {
    let record_size: u8 = record_size
        .parse()
        .map_err(|_| DiskError::InvalidRecordSize.to_io_error())?;
    let data = fs::read(source_filename)?;
    let (name, _) = host_stem_and_ext(source_filename);

    disk.add_rel_file(&name, record_size, &data)?;
    println!("Added file: {} to {}", source_filename, disk.disk_name());
    Ok(())
}

fn op_extract(disk: &mut D64, filename: &str, destination: Option<&str>) -> io::Result<()> {
    let name: Petscii = filename.into();
    let entry = disk.find_directory_entry(&name)?;
    let data = disk.extract_file(&name)?;

    let destination = match destination {
        Some(destination) => destination.to_string(),
        None => format!(
            "{}.{}",
            entry.filename.to_string().to_lowercase(),
            entry.file_attributes.file_type.extension()
        ),
    };
    fs::write(&destination, &data)?;
    println!("Extracted file: {} to {}", filename, destination);
    Ok(())
}

/// Locked files are refused by the destructive commands; the engine treats
/// the flag as advisory.
fn check_unlocked(disk: &D64, name: &Petscii) -> io::Result<()> {
    let entry = disk.find_directory_entry(name)?;
    if entry.file_attributes.locked_flag {
        eprintln!("File {:?} is locked; unlock it first.", name);
        return Err(DiskError::IoError.into());
    }
    Ok(())
}

fn op_remove(disk: &mut D64, filename: &str) -> io::Result<()> {
    let name: Petscii = filename.into();
    check_unlocked(disk, &name)?;
    disk.remove_file(&name)?;
    println!("Removed file: {} from {}", filename, disk.disk_name());
    Ok(())
}

fn op_rename(disk: &mut D64, original_filename: &str, new_filename: &str) -> io::Result<()> {
    let original: Petscii = original_filename.into();
    check_unlocked(disk, &original)?;
    disk.rename_file(&original, &new_filename.into())?;
    println!("Renamed file: {} => {}", original_filename, new_filename);
    Ok(())
}

fn op_rename_disk(disk: &mut D64, new_name: &str) -> io::Result<()> {
    disk.rename_disk(&new_name.into())?;
    println!("Renamed disk {}", disk.disk_name());
    Ok(())
}

fn op_lock(disk: &mut D64, filename: &str, locked: bool) -> io::Result<()> {
    disk.set_locked(&filename.into(), locked)?;
    println!(
        "{} file: {} on {}",
        if locked { "Locked" } else { "Unlocked" },
        filename,
        disk.disk_name()
    );
    Ok(())
}

fn op_bam(disk: &mut D64) -> io::Result<()> {
    for track in 1..=disk.tracks() {
        let entry = disk.bam_track(track)?;
        print!("{:>4} ", track);
        for sector in 0..disk.sectors_in_track(track)? {
            print!("{}", if entry.is_free(sector) { '.' } else { '*' });
        }
        println!();
    }
    println!("{} blocks free.", disk.free_sector_count());
    Ok(())
}

fn op_dump(disk: &mut D64, track: u8, sector: u8) -> io::Result<()> {
    let data = disk.read_sector(track, sector)?;
    println!("TRACK {} SECTOR {}", track, sector);
    println!("{}", util::hex(&data));
    Ok(())
}

fn op_verify(disk: &mut D64, fix: bool) -> io::Result<()> {
    let result = disk.verify(fix)?;
    for discrepancy in result.discrepancies.iter() {
        println!("{}", discrepancy);
    }
    if result.ok {
        println!("BAM integrity check passed.");
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::Other,
            format!("{} errors found in BAM.", result.discrepancies.len()),
        ))
    }
}

fn op_reorder(disk: &mut D64, order: &[String]) -> io::Result<()> {
    let order: Vec<Petscii> = order.iter().map(Petscii::from).collect();
    disk.reorder_directory(&order)?;
    println!("Reordered files on disk.");
    Ok(())
}

/// Prompt on each collision, remembering the sticky "all"/"none" answers.
struct PromptPolicy {
    sticky: Option<Overwrite>,
}

impl OverwritePolicy for PromptPolicy {
    fn resolve(&mut self, filename: &Petscii) -> Overwrite {
        if let Some(sticky) = self.sticky {
            return sticky;
        }
        loop {
            print!(
                "File \"{}\" already exists. Overwrite? (y/n or a=all/x=none): ",
                filename
            );
            let _ = io::stdout().flush();
            let mut response = String::new();
            if io::stdin().read_line(&mut response).is_err() {
                return Overwrite::SkipFile;
            }
            match response.trim().to_uppercase().as_str() {
                "Y" => return Overwrite::OverwriteFile,
                "N" => return Overwrite::SkipFile,
                "A" => {
                    self.sticky = Some(Overwrite::OverwriteAll);
                    return Overwrite::OverwriteAll;
                }
                "X" => {
                    self.sticky = Some(Overwrite::SkipAll);
                    return Overwrite::SkipAll;
                }
                _ => {}
            }
        }
    }
}

fn cmd_backup(diskimage: &str, disks: &[String]) -> io::Result<()> {
    // Targets are named from the image stem: base.d64, base1.d64, ...
    let base = diskimage
        .strip_suffix(".d64")
        .or_else(|| diskimage.strip_suffix(".D64"))
        .unwrap_or(diskimage);

    let mut policy = PromptPolicy { sticky: None };
    let mut session = BackupSession::new(base, 35, &mut policy)?;
    for (n, source_path) in disks.iter().enumerate() {
        println!("disk {} of {} {}", n + 1, disks.len(), source_path);
        let source = D64::open(source_path, false)?;
        session.copy_from(&source)?;
    }
    for disk in session.finish()? {
        fs::write(&disk.name, &disk.image)?;
        println!("Wrote {}", disk.name);
    }
    println!("Backup complete: {}.d64", base);
    Ok(())
}

/// The interactive shell holds a long-lived engine for the current disk;
/// mutating commands save after each operation.
struct ShellSession {
    path: Option<String>,
    disk: Option<D64>,
}

impl ShellSession {
    fn load(&mut self, path: &str) {
        match D64::open(path, true) {
            Ok(disk) => {
                println!("Loaded disk: {}", path);
                self.path = Some(path.to_string());
                self.disk = Some(disk);
            }
            Err(e) => {
                eprintln!("Error: Failed to load disk: {}", e);
            }
        }
    }
}

fn shell_help() {
    println!("Commands:");
    println!("  load <disk.d64>            select the current disk");
    println!("  dir | list                 directory listing");
    println!("  bam                        show the BAM");
    println!("  add <hostfile>             add a host file");
    println!("  addrel <hostfile> <recsz>  add a host file as REL");
    println!("  extract <name> [out]       extract a file");
    println!("  remove <name>              remove a file");
    println!("  rename <old> <new>         rename a file");
    println!("  rename-disk <name>         rename the disk");
    println!("  lock <name> | unlock <name>");
    println!("  dump <track> <sector>      hex dump a sector");
    println!("  verify [fix]               check (and repair) the BAM");
    println!("  compact                    pack the directory");
    println!("  reorder <names...>         reorder the directory");
    println!("  exit");
}

fn shell(initial: Option<&str>) {
    let mut session = ShellSession {
        path: None,
        disk: None,
    };
    if let Some(path) = initial {
        session.load(path);
    }
    println!("d64 interactive mode (type 'help' for commands, 'exit' to quit)");

    loop {
        print!("[{}] d64> ", session.path.as_deref().unwrap_or("no disk"));
        let _ = io::stdout().flush();

        let mut input = String::new();
        match io::stdin().read_line(&mut input) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let args: Vec<&str> = input.split_whitespace().collect();
        if args.is_empty() {
            continue;
        }
        let (command, params) = (args[0], &args[1..]);
        if command == "exit" || command == "quit" {
            break;
        }
        if command == "help" {
            shell_help();
            continue;
        }
        if command == "load" {
            match params.first() {
                Some(path) => session.load(path),
                None => eprintln!("Error: Missing parameters for command load"),
            }
            continue;
        }

        let disk = match session.disk.as_mut() {
            Some(disk) => disk,
            None => {
                eprintln!("Error: no disk loaded (use: load <disk.d64>)");
                continue;
            }
        };

        // Commands that modify the image save it afterwards.
        let mut mutated = true;
        let result = match (command, params) {
            ("dir", _) | ("list", _) => {
                mutated = false;
                op_dir(disk)
            }
            ("bam", _) => {
                mutated = false;
                op_bam(disk)
            }
            ("add", [file]) => op_add(disk, file),
            ("addrel", [file, recsz]) => op_addrel(disk, file, recsz),
            ("extract", [name]) => {
                mutated = false;
                op_extract(disk, name, None)
            }
            ("extract", [name, out]) => {
                mutated = false;
                op_extract(disk, name, Some(*out))
            }
            ("remove", [name]) | ("del", [name]) => op_remove(disk, name),
            ("rename", [old, new]) => op_rename(disk, old, new),
            ("rename-disk", [name]) => op_rename_disk(disk, name),
            ("lock", [name]) => op_lock(disk, name, true),
            ("unlock", [name]) => op_lock(disk, name, false),
            ("dump", [track, sector]) => match (track.parse(), sector.parse()) {
                (Ok(track), Ok(sector)) => {
                    mutated = false;
                    op_dump(disk, track, sector)
                }
                _ => {
                    eprintln!("Error: dump expects numeric track and sector");
                    continue;
                }
            },
            ("verify", params) => op_verify(disk, params.first() == Some(&"fix")),
            ("compact", _) => {
                let result = disk.compact_directory();
                if result.is_ok() {
                    println!("Compacted directory.");
                }
                result
            }
            ("reorder", names) => {
                let order: Vec<String> = names.iter().map(|s| s.to_string()).collect();
                op_reorder(disk, &order)
            }
            _ => {
                eprintln!("Error: Unknown command \"{}\"", command);
                continue;
            }
        };
        let result = result.and_then(|_| if mutated { disk.save().map(|_| ()) } else { Ok(()) });
        if let Err(e) = result {
            eprintln!("Error: {}", e);
        }
    }
}
