use std::path::{Path, PathBuf};

use coreinject::config::Config;
use coreinject::errors::InjectError;
use coreinject::logging::setup_logger;

use clap::Parser;
use object::pe;
use object::read::pe::{ImageNtHeaders, ImageOptionalHeader, PeFile, PeFile32, PeFile64};
use object::FileKind;
use serde::Serialize;
use tracing::{debug, trace};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about,
    long_about,
    help_template = r#"{about-section}
{usage-heading} {usage}
{all-args}{tab}

{name}: v{version}
Authors: {author-with-newline}
"#
)]
/// Coreinject Inspector - show what the bootstrap would hook in an executable
///
/// Reads a PE executable from disk and prints the entry point and TLS callbacks that the
/// runtime takes over when it is loaded into that executable.
struct Args {
    #[arg(short, long)]
    /// The PE executable to inspect
    image: PathBuf,

    #[arg(long)]
    /// Print the result as JSON
    json: bool,

    #[arg(short, long, default_value = "warn")]
    /// Log level (error, warn, info, debug, trace)
    log_level: String,
}

#[derive(Serialize, Debug)]
struct Inspection {
    path: PathBuf,
    format: &'static str,
    image_base: u64,
    entry_rva: u32,
    entry_va: u64,
    tls_callbacks: Vec<u64>,
}

fn main() -> Result<(), InjectError> {
    human_panic::setup_panic!();
    let args = Args::parse();
    setup_logger(&Config {
        log_level: args.log_level.clone(),
        ..Default::default()
    })?;

    let data = std::fs::read(&args.image)?;
    debug!("read {} bytes from {}", data.len(), args.image.display());

    let inspection = match FileKind::parse(&*data)? {
        FileKind::Pe32 => inspect(&args.image, &PeFile32::parse(&*data)?, "PE32")?,
        FileKind::Pe64 => inspect(&args.image, &PeFile64::parse(&*data)?, "PE32+")?,
        other => {
            return Err(InjectError::MalformedImage(format!(
                "{} is not a PE executable ({other:?})",
                args.image.display()
            )))
        }
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&inspection)?);
    } else {
        print_text(&inspection);
    }
    Ok(())
}

fn inspect<Pe: ImageNtHeaders>(
    path: &Path,
    file: &PeFile<'_, Pe>,
    format: &'static str,
) -> Result<Inspection, InjectError> {
    let optional = file.nt_headers().optional_header();
    let image_base = optional.image_base();
    let entry_rva = optional.address_of_entry_point();

    Ok(Inspection {
        path: path.to_path_buf(),
        format,
        image_base,
        entry_rva,
        entry_va: if entry_rva == 0 {
            0
        } else {
            image_base + u64::from(entry_rva)
        },
        tls_callbacks: tls_callbacks(file, image_base)?,
    })
}

fn tls_callbacks<Pe: ImageNtHeaders>(
    file: &PeFile<'_, Pe>,
    image_base: u64,
) -> Result<Vec<u64>, InjectError> {
    let Some(dir) = file.data_directory(pe::IMAGE_DIRECTORY_ENTRY_TLS) else {
        return Ok(Vec::new());
    };
    let sections = file.section_table();
    let tls = dir.data(file.data(), &sections)?;

    let pointer_size = if file.nt_headers().is_type_64() { 8 } else { 4 };
    // AddressOfCallBacks follows the raw data range and AddressOfIndex
    let callbacks_va = read_pointer(tls, 3 * pointer_size, pointer_size)
        .ok_or_else(|| InjectError::MalformedImage("truncated TLS directory".to_string()))?;
    trace!("TLS callback array at {callbacks_va:#x}");
    if callbacks_va == 0 {
        return Ok(Vec::new());
    }

    let rva = callbacks_va
        .checked_sub(image_base)
        .and_then(|rva| u32::try_from(rva).ok())
        .ok_or_else(|| {
            InjectError::MalformedImage(format!(
                "TLS callback array {callbacks_va:#x} lies outside of the image"
            ))
        })?;
    let array = sections.pe_data_at(file.data(), rva).ok_or_else(|| {
        InjectError::MalformedImage(format!("TLS callback array at rva {rva:#x} is not in a section"))
    })?;

    Ok((0..)
        .map_while(|i| read_pointer(array, i * pointer_size, pointer_size))
        .take_while(|callback| *callback != 0)
        .collect())
}

fn read_pointer(data: &[u8], offset: usize, size: usize) -> Option<u64> {
    let raw = data.get(offset..offset.checked_add(size)?)?;
    let mut buf = [0u8; 8];
    buf[..size].copy_from_slice(raw);
    Some(u64::from_le_bytes(buf))
}

fn print_text(inspection: &Inspection) {
    println!("image:         {}", inspection.path.display());
    println!("format:        {}", inspection.format);
    println!("image base:    {:#x}", inspection.image_base);
    if inspection.entry_rva == 0 {
        println!("entry point:   none");
    } else {
        println!(
            "entry point:   {:#x} (rva {:#x})",
            inspection.entry_va, inspection.entry_rva
        );
    }
    if inspection.tls_callbacks.is_empty() {
        println!("TLS callbacks: none");
    } else {
        println!("TLS callbacks:");
        for callback in &inspection.tls_callbacks {
            println!("  {callback:#x}");
        }
    }
}
