//! `chickadeefsck` verifies a ChickadeeFS image, optionally replaying
//! its journal in place.

use std::env;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::process::exit;

use chickadeefs::check::{check_image, CheckOptions};

fn usage() -> ! {
    eprintln!("Usage: chickadeefsck [-V] [-r] [IMAGE]");
    exit(1);
}

fn main() {
    let mut verbose = false;
    let mut replay = false;
    let mut image_path: Option<String> = None;

    for arg in env::args().skip(1) {
        if arg == "-V" {
            verbose = true;
        } else if arg == "-r" {
            replay = true;
        } else if arg == "-Vr" || arg == "-rV" {
            verbose = true;
            replay = true;
        } else if arg == "-" {
            image_path = None;
        } else if arg.starts_with('-') {
            usage();
        } else if image_path.replace(arg).is_some() {
            usage();
        }
    }

    // read the disk image
    let mut image = Vec::new();
    let read_result = match image_path.as_deref() {
        Some(path) => File::open(path).and_then(|mut f| f.read_to_end(&mut image)),
        None => {
            if replay {
                eprintln!("can't modify file to replay journal");
                exit(1);
            }
            io::stdin().read_to_end(&mut image)
        }
    };
    if let Err(err) = read_result {
        eprintln!(
            "{}: {}",
            image_path.as_deref().unwrap_or("<stdin>"),
            err
        );
        exit(1);
    }

    let opts = CheckOptions { verbose };
    let mut stdout = io::stdout();
    let report = check_image(&mut image, &opts, &mut stdout);

    // persist the recovered image when asked to
    if replay {
        let path = image_path.as_deref().expect("replay requires a file");
        let written = OpenOptions::new()
            .write(true)
            .open(path)
            .and_then(|mut f| f.write_all(&image));
        if let Err(err) = written {
            eprintln!("{path}: {err}");
            exit(1);
        }
    }

    exit(if report.ok() { 0 } else { 1 });
}
