use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{value_parser, Arg, ArgMatches, Command};
use env_logger::Env;
use log::error;
use vdfs::{FileKind, FileSystem, FsConfig, FsError, Result, NCACHE, ROOTINO};

fn cli() -> Command {
    let path = || Arg::new("path").required(true).help("absolute path inside the image");
    Command::new("vdfs")
        .about("Inspect and edit virtual disk images")
        .subcommand_required(true)
        .arg(
            Arg::new("image")
                .long("image")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("disk image file"),
        )
        .arg(
            Arg::new("cache")
                .long("cache")
                .global(true)
                .value_parser(value_parser!(usize))
                .default_value("8")
                .help("blocks held by the cache"),
        )
        .arg(
            Arg::new("io-delay-us")
                .long("io-delay-us")
                .global(true)
                .value_parser(value_parser!(u64))
                .default_value("0")
                .help("delay of every disk access, in microseconds"),
        )
        .subcommand(
            Command::new("format")
                .about("Create a new formatted image")
                .arg(blocks_arg()),
        )
        .subcommand(Command::new("mkdir").about("Make a directory").arg(path()))
        .subcommand(
            Command::new("put")
                .about("Write a local file into the image, creating it if needed")
                .arg(path())
                .arg(Arg::new("file").required(true).value_parser(value_parser!(PathBuf)))
                .arg(
                    Arg::new("offset")
                        .long("offset")
                        .value_parser(value_parser!(usize))
                        .default_value("0"),
                ),
        )
        .subcommand(Command::new("cat").about("Print a file").arg(path()))
        .subcommand(Command::new("ls").about("List a directory").arg(path()))
        .subcommand(Command::new("rm").about("Remove a file or an empty directory").arg(path()))
        .subcommand(
            Command::new("cp")
                .about("Copy a file, sharing its blocks")
                .arg(Arg::new("src").required(true))
                .arg(Arg::new("dst").required(true)),
        )
        .subcommand(
            Command::new("append")
                .about("Append file <src> to file <dst>")
                .arg(Arg::new("dst").required(true))
                .arg(Arg::new("src").required(true)),
        )
        .subcommand(Command::new("defrag").about("Compact the data blocks"))
        .subcommand(Command::new("usage").about("Show which paths use each block"))
        .subcommand(Command::new("bitmaps").about("Dump the block and inode bitmaps"))
        .subcommand(Command::new("inodes").about("Dump the inode table"))
        .subcommand(
            Command::new("demo")
                .about("Run a copy-on-write walkthrough on a scratch disk")
                .arg(blocks_arg()),
        )
}

fn blocks_arg() -> Arg {
    Arg::new("blocks")
        .long("blocks")
        .value_parser(value_parser!(usize))
        .default_value("64")
        .help("number of 512 byte blocks")
}

fn config(args: &ArgMatches) -> FsConfig {
    let cache = args.get_one::<usize>("cache").copied().unwrap_or(NCACHE);
    let delay = args.get_one::<u64>("io-delay-us").copied().unwrap_or(0);
    FsConfig {
        cache_capacity: cache,
        io_delay: Duration::from_micros(delay),
        ..Default::default()
    }
}

fn arg<'a>(args: &'a ArgMatches, id: &str) -> Result<&'a str> {
    args.get_one::<String>(id)
        .map(String::as_str)
        .ok_or_else(|| FsError::InvalidArgument(format!("missing <{id}>")))
}

fn image(args: &ArgMatches) -> Result<&PathBuf> {
    args.get_one::<PathBuf>("image")
        .ok_or_else(|| FsError::InvalidArgument("--image is required".to_owned()))
}

/// "/a/b/c" -> ("/a/b", "c")
fn split(path: &str) -> Result<(&str, &str)> {
    let (parent, name) = path
        .trim_end_matches('/')
        .rsplit_once('/')
        .ok_or_else(|| FsError::InvalidArgument(format!("path {path:?} is not absolute")))?;
    Ok((if parent.is_empty() { "/" } else { parent }, name))
}

fn run(matches: &ArgMatches) -> Result<()> {
    let Some((cmd, args)) = matches.subcommand() else {
        return Ok(());
    };
    let config = config(args);

    match cmd {
        "format" => {
            let image = image(args)?;
            let blocks = args.get_one::<usize>("blocks").copied().unwrap_or(64);
            let fs = FileSystem::with_config(blocks, config)?;
            fs.format()?;
            fs.save(image)?;
            println!("formatted {} ({blocks} blocks)", image.display());
            Ok(())
        }
        "demo" => {
            let blocks = args.get_one::<usize>("blocks").copied().unwrap_or(64);
            demo(blocks, config)
        }
        _ => {
            let image = image(args)?;
            let fs = FileSystem::open(image, config)?;
            if edit(&fs, cmd, args)? {
                fs.save(image)?;
            }
            Ok(())
        }
    }
}

/// Runs one command on an opened image. Returns whether the image changed.
fn edit(fs: &FileSystem, cmd: &str, args: &ArgMatches) -> Result<bool> {
    let mut out = io::stdout().lock();
    match cmd {
        "mkdir" => {
            let (parent, name) = split(arg(args, "path")?)?;
            fs.mkdir(fs.lookup(parent)?, name)?;
            Ok(true)
        }
        "put" => {
            let path = arg(args, "path")?;
            let file = args
                .get_one::<PathBuf>("file")
                .ok_or_else(|| FsError::InvalidArgument("missing <file>".to_owned()))?;
            let offset = args.get_one::<usize>("offset").copied().unwrap_or(0);
            let data = std::fs::read(file)?;

            let ino = match fs.lookup(path) {
                Ok(ino) => ino,
                Err(FsError::NotFound(_)) => {
                    let (parent, name) = split(path)?;
                    fs.create(fs.lookup(parent)?, name)?
                }
                Err(e) => return Err(e),
            };
            let size = fs.write(ino, offset, &data)?;
            writeln!(out, "{path}: {size} bytes")?;
            Ok(true)
        }
        "cat" => {
            let ino = fs.lookup(arg(args, "path")?)?;
            let size = fs.get_attrs(ino)?.size as usize;
            out.write_all(&fs.read(ino, 0, size)?)?;
            Ok(false)
        }
        "ls" => {
            let dir = fs.lookup(arg(args, "path")?)?;
            for entry in fs.readdir(dir, usize::MAX)? {
                let tag = if entry.kind == FileKind::Directory { 'd' } else { '-' };
                writeln!(out, "{tag} {}", entry.name)?;
            }
            Ok(false)
        }
        "rm" => {
            let (parent, name) = split(arg(args, "path")?)?;
            fs.remove(fs.lookup(parent)?, name)?;
            Ok(true)
        }
        "cp" => {
            let (src_parent, src_name) = split(arg(args, "src")?)?;
            let (dst_parent, dst_name) = split(arg(args, "dst")?)?;
            fs.copy(fs.lookup(src_parent)?, src_name, fs.lookup(dst_parent)?, dst_name)?;
            Ok(true)
        }
        "append" => {
            let (dst_parent, dst_name) = split(arg(args, "dst")?)?;
            let (src_parent, src_name) = split(arg(args, "src")?)?;
            let size = fs.append(fs.lookup(dst_parent)?, dst_name, fs.lookup(src_parent)?, src_name)?;
            writeln!(out, "{}: {size} bytes", arg(args, "dst")?)?;
            Ok(true)
        }
        "defrag" => {
            let moves = fs.defrag()?;
            writeln!(out, "{moves} block moves")?;
            Ok(true)
        }
        "usage" => {
            write!(out, "{}", fs.dump_disk_usage()?)?;
            Ok(false)
        }
        "bitmaps" => {
            write!(out, "{}", fs.dump_bitmaps())?;
            Ok(false)
        }
        "inodes" => {
            write!(out, "{}", fs.dump_inodes())?;
            Ok(false)
        }
        _ => Err(FsError::InvalidArgument(format!("unknown command {cmd}"))),
    }
}

fn demo(blocks: usize, config: FsConfig) -> Result<()> {
    let fs = FileSystem::with_config(blocks, config)?;
    fs.format()?;

    let d = fs.mkdir(ROOTINO, "d")?;
    let f = fs.create(d, "f")?;
    fs.write(f, 0, b"hello")?;
    let g = fs.copy(d, "f", d, "g")?;
    fs.write(g, 0, b"H")?;

    let mut out = io::stdout().lock();
    writeln!(out, "/d/f: {}", String::from_utf8_lossy(&fs.read(f, 0, 5)?))?;
    writeln!(out, "/d/g: {}", String::from_utf8_lossy(&fs.read(g, 0, 5)?))?;
    write!(out, "{}", fs.dump_disk_usage()?)?;
    write!(out, "{}", fs.dump_cache())?;
    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    match run(&cli().get_matches()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
