//! `mkchickadeefs` builds a fresh ChickadeeFS image from a boot sector
//! and a list of host files.

use std::env;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use std::process::exit;

use chickadeefs::mkfs::{build_image, BuildParams, InputFile};

/// Minimum output size; short images are padded with zero blocks so
/// emulators accept them as disks.
const MIN_IMAGE_SIZE: usize = 1 << 19;

fn usage() -> ! {
    eprintln!(
        "Usage: mkchickadeefs [-b NBLOCKS] [-i NINODES] [-w NSWAP] [-j NJOURNAL] \
         [-f FIRSTDATABN] [-s BOOTSECTOR] [-o OUTPUT] [FILE[:NAME]...]"
    );
    exit(1);
}

fn fail(msg: &str) -> ! {
    eprintln!("mkchickadeefs: {msg}");
    exit(1);
}

fn parse_u32(arg: &str, opt: char, prev: u32) -> u32 {
    match arg.parse::<u32>() {
        Ok(n) if n > 0 && n <= 0x7FFF_FFFF && prev == 0 => n,
        _ => fail(&format!("bad `-{opt}` argument")),
    }
}

// Default entry name for a host path: the original layout keeps kernel
// binaries under obj/ and initfs/, which are not part of the name.
fn default_name(path: &str) -> &str {
    for prefix in ["obj/p-", "obj/", "initfs/"] {
        if let Some(stripped) = path.strip_prefix(prefix) {
            return stripped;
        }
    }
    path
}

fn read_input(path: &str) -> Vec<u8> {
    let mut data = Vec::new();
    let result = if path == "-" {
        io::stdin().read_to_end(&mut data)
    } else {
        File::open(path).and_then(|mut f| f.read_to_end(&mut data))
    };
    if let Err(err) = result {
        fail(&format!("{path}: {err}"));
    }
    data
}

struct Args {
    params: BuildParams,
    outfile: Option<String>,
    inputs: Vec<(String, String)>,
}

fn parse_args() -> Args {
    let mut params = BuildParams {
        nblocks: 0,
        ..BuildParams::default()
    };
    let mut bootsector: Option<String> = None;
    let mut outfile: Option<String> = None;
    let mut inputs = Vec::new();

    let argv: Vec<String> = env::args().skip(1).collect();
    let mut i = 0;
    while i < argv.len() {
        let arg = &argv[i];
        let (opt, attached) = match arg.as_str() {
            s if s.len() >= 2 && s.starts_with('-') && s != "-" => {
                (s.as_bytes()[1] as char, &s[2..])
            }
            _ => {
                // positional input: HOSTPATH[:NAME]
                let (path, name) = match arg.split_once(':') {
                    Some((path, name)) => (path.to_string(), name.to_string()),
                    None => (arg.clone(), default_name(arg).to_string()),
                };
                inputs.push((path, name));
                i += 1;
                continue;
            }
        };
        let value = if !attached.is_empty() {
            attached.to_string()
        } else {
            i += 1;
            match argv.get(i) {
                Some(v) => v.clone(),
                None => usage(),
            }
        };
        match opt {
            'b' => params.nblocks = parse_u32(&value, 'b', params.nblocks),
            'i' => params.ninodes = parse_u32(&value, 'i', params.ninodes),
            'w' => params.nswap = parse_u32(&value, 'w', params.nswap),
            'j' => params.njournal = parse_u32(&value, 'j', params.njournal),
            'f' => params.first_data_bn = parse_u32(&value, 'f', params.first_data_bn),
            's' => {
                if bootsector.replace(value).is_some() {
                    fail("bad `-s` argument");
                }
            }
            'o' => {
                if outfile.replace(value).is_some() {
                    fail("bad `-o` argument");
                }
            }
            _ => usage(),
        }
        i += 1;
    }

    params.bootsector = bootsector.map(|path| read_input(&path));
    Args {
        params,
        outfile,
        inputs,
    }
}

fn main() {
    let args = parse_args();

    let files: Vec<InputFile> = args
        .inputs
        .iter()
        .map(|(path, name)| {
            if path == "-" {
                InputFile::from_bytes(name, read_input(path))
            } else {
                InputFile::from_path(Path::new(path), name).unwrap_or_else(|err| {
                    fail(&format!("{path}: {err:?}"));
                })
            }
        })
        .collect();

    let mut image = match build_image(&args.params, &files) {
        Ok(image) => image,
        // the builder has already reported the specific failure
        Err(_) => exit(1),
    };
    if image.len() < MIN_IMAGE_SIZE {
        image.resize(MIN_IMAGE_SIZE, 0);
    }

    let write_result = match args.outfile.as_deref() {
        Some(path) if path != "-" => {
            File::create(path).and_then(|mut f| f.write_all(&image))
        }
        _ => io::stdout().write_all(&image),
    };
    if let Err(err) = write_result {
        let target = args.outfile.as_deref().unwrap_or("-");
        fail(&format!("{target}: {err}"));
    }
}
