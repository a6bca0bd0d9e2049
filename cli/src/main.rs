//! Host-side provisioning and inspection tool for redoubt flash images.
//!
//! Works on raw image files instead of a live device: format a store
//! and load assets into it, build and stage firmware images, then walk
//! the swap state machine one boot at a time.

use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use zeroize::Zeroizing;

use redoubt_boot::{
    build_image, mark_confirmed, mark_pending, requested_swap, scan_status_bytes, status_source,
    BootStatus, Bootloader, Crc32Verifier, ImageHeader, ImageVersion, RamCounter, Region, SlotMap,
    StatusSource, SwapState, SwapType, Trailer,
};
use redoubt_flash::sim::SimFlash;
use redoubt_flash::BlockFlash;
use redoubt_store::{catalog, AppId, AssetService, Caller, EnvelopeCipher, Perms, StoreGeometry};

mod artifact;

use artifact::{Artifact, AssetRecord};

const SCRYPT_LOG_N: u8 = 14;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;
const DEFAULT_SALT: &str = "redoubt-store-v1";

#[derive(Parser, Debug, Clone)]
#[command(name = "redoubt", version, about = "Provision and inspect redoubt flash images")]
struct Cli {
    /// Path to the flash image or image binary the command works on.
    #[arg(short, long, value_name = "PATH")]
    image: PathBuf,

    /// Erase-block size of the store image in bytes.
    #[arg(long, default_value_t = 4096)]
    block_size: u32,

    /// Erase-block count of a newly created store image.
    #[arg(long, default_value_t = 5)]
    blocks: u32,

    /// Object table capacity; must match the value the image was formatted with.
    #[arg(long, default_value_t = 10)]
    slots: u16,

    /// Encrypt asset payloads and metadata with a key derived from this passphrase.
    #[arg(long, value_name = "PASSPHRASE")]
    passphrase: Option<String>,

    /// Salt mixed into the passphrase key derivation.
    #[arg(long, default_value = DEFAULT_SALT)]
    salt: String,

    /// Seal with AES-256-GCM instead of ChaCha20-Poly1305.
    #[arg(long)]
    aes_gcm: bool,

    /// Act as this client application instead of the secure provisioner.
    #[arg(long, value_name = "APP_ID")]
    app: Option<u32>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Create and format a store image file.
    Init(InitArgs),
    /// List every provisioned asset.
    List,
    /// Write an asset's payload, creating the asset if needed.
    Put(PutArgs),
    /// Read an asset's payload.
    Get(GetArgs),
    /// Delete an asset.
    Delete(AssetArgs),
    /// Show one asset's sizes and access grants.
    Info(AssetArgs),
    /// Show the store image's shape and usage.
    Inspect,
    /// Export every asset into a CBOR artifact.
    Export(FileArgs),
    /// Import assets from a CBOR artifact.
    Import(FileArgs),
    /// Build a bootable image binary at the --image path.
    ImageCreate(ImageCreateArgs),
    /// Copy an image binary into a slot of a boot flash image.
    BootInstall(BootInstallArgs),
    /// Queue the staged image for a swap on the next boot.
    BootRequest(BootRequestArgs),
    /// Confirm the image in the primary slot.
    BootConfirm(BootArgs),
    /// Show slot contents, trailer states, and the swap the next boot would run.
    BootStatus(BootArgs),
    /// Run one boot, performing whatever swap is due.
    BootRun(BootArgs),
}

#[derive(Args, Debug, Clone)]
struct InitArgs {
    /// Overwrite an existing image file.
    #[arg(long)]
    force: bool,
}

#[derive(Args, Debug, Clone)]
struct AssetArgs {
    /// Asset uuid, decimal or 0x-prefixed hex.
    #[arg(long, value_name = "UUID")]
    uuid: String,
}

#[derive(Args, Debug, Clone)]
struct PutArgs {
    /// Asset uuid, decimal or 0x-prefixed hex.
    #[arg(long, value_name = "UUID")]
    uuid: String,
    /// File holding the payload bytes.
    #[arg(long, value_name = "PATH")]
    file: Option<PathBuf>,
    /// Payload bytes as a hex string.
    #[arg(long, value_name = "HEX")]
    hex: Option<String>,
    /// Byte offset to write at.
    #[arg(long, default_value_t = 0)]
    offset: u32,
}

#[derive(Args, Debug, Clone)]
struct GetArgs {
    /// Asset uuid, decimal or 0x-prefixed hex.
    #[arg(long, value_name = "UUID")]
    uuid: String,
    /// Write the payload to this file instead of printing hex.
    #[arg(long, value_name = "PATH")]
    out: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
struct FileArgs {
    /// Artifact file to write or read.
    #[arg(long, value_name = "PATH")]
    file: PathBuf,
}

#[derive(Args, Debug, Clone)]
struct BootArgs {
    /// Erase-block size of the boot image in bytes.
    #[arg(long, default_value_t = 512)]
    block_size: u32,
    /// Blocks per image slot.
    #[arg(long, default_value_t = 4)]
    slot_blocks: u32,
    /// Blocks in the scratch area.
    #[arg(long, default_value_t = 1)]
    scratch_blocks: u32,
}

#[derive(Args, Debug, Clone)]
struct ImageCreateArgs {
    /// File holding the image payload.
    #[arg(long, value_name = "PATH")]
    payload: PathBuf,
    /// Image version as major.minor.revision+build.
    #[arg(long, default_value = "0.0.0+0")]
    version: String,
    /// Security counter embedded in the header.
    #[arg(long, default_value_t = 0)]
    counter: u32,
}

#[derive(Args, Debug, Clone)]
struct BootInstallArgs {
    #[command(flatten)]
    geo: BootArgs,
    /// Image binary to install.
    #[arg(long, value_name = "PATH")]
    binary: PathBuf,
    /// Install into the secondary (staging) slot.
    #[arg(long)]
    secondary: bool,
}

#[derive(Args, Debug, Clone)]
struct BootRequestArgs {
    #[command(flatten)]
    geo: BootArgs,
    /// Keep the swapped image without a confirmation boot.
    #[arg(long)]
    permanent: bool,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    run(cli)
}

fn run(cli: Cli) -> Result<()> {
    match &cli.command {
        Command::Init(args) => execute_init(&cli, args),
        Command::List => execute_list(&cli),
        Command::Put(args) => execute_put(&cli, args),
        Command::Get(args) => execute_get(&cli, args),
        Command::Delete(args) => execute_delete(&cli, args),
        Command::Info(args) => execute_info(&cli, args),
        Command::Inspect => execute_inspect(&cli),
        Command::Export(args) => execute_export(&cli, args),
        Command::Import(args) => execute_import(&cli, args),
        Command::ImageCreate(args) => execute_image_create(&cli, args),
        Command::BootInstall(args) => execute_boot_install(&cli, args),
        Command::BootRequest(args) => execute_boot_request(&cli, args),
        Command::BootConfirm(args) => execute_boot_confirm(&cli, args),
        Command::BootStatus(args) => execute_boot_status(&cli, args),
        Command::BootRun(args) => execute_boot_run(&cli, args),
    }
}

// ---- store commands ----

fn execute_init(cli: &Cli, args: &InitArgs) -> Result<()> {
    if cli.image.exists() && !args.force {
        bail!(
            "'{path}' already exists; pass --force to overwrite it",
            path = cli.image.display(),
        );
    }
    let geo = StoreGeometry {
        block_size: cli.block_size,
        block_count: cli.blocks,
        object_slots: cli.slots,
        encrypted: cli.passphrase.is_some(),
    };
    if !geo.is_valid() {
        bail!(
            "refusing the store geometry: {blocks} blocks x {size} bytes cannot hold {slots} object slots",
            blocks = geo.block_count,
            size = geo.block_size,
            slots = geo.object_slots,
        );
    }
    let flash = SimFlash::new(geo.block_size, geo.block_count);
    let mut service = AssetService::new(flash, geo, cipher_for(cli)?, catalog::CATALOG)
        .map_err(|err| anyhow!("cannot open the store: {err}"))?;
    service
        .wipe_all()
        .map_err(|err| anyhow!("formatting failed: {err}"))?;
    save_flash(cli, service.store().flash())?;
    println!(
        "Initialized {mode} store image '{path}' ({blocks} blocks x {size} bytes, {slots} object slots).",
        mode = if geo.encrypted { "encrypted" } else { "plaintext" },
        path = cli.image.display(),
        blocks = geo.block_count,
        size = geo.block_size,
        slots = geo.object_slots,
    );
    Ok(())
}

fn execute_list(cli: &Cli) -> Result<()> {
    let mut service = mount_service(cli, load_flash(cli)?)?;
    let mut entries = service
        .store_mut()
        .entries()
        .map_err(|err| anyhow!("cannot walk the object table: {err}"))?;
    entries.sort_by_key(|(uuid, _)| *uuid);

    if entries.is_empty() {
        println!("No assets provisioned.");
        return Ok(());
    }
    println!("{count} asset(s):", count = entries.len());
    for (uuid, info) in entries {
        println!(
            "  {uuid:#06x}  {name:<16} {cur:>5} / {max:>5} bytes",
            name = asset_name(uuid),
            cur = info.cur_size,
            max = info.max_size,
        );
    }
    Ok(())
}

fn execute_put(cli: &Cli, args: &PutArgs) -> Result<()> {
    let uuid = parse_uuid(&args.uuid)?;
    let payload = read_payload(args)?;
    let mut service = mount_service(cli, load_flash(cli)?)?;
    let caller = caller_for(cli);
    let handle = match service.get_handle(&caller, uuid) {
        Ok(handle) => handle,
        Err(_) => service
            .create(&caller, uuid)
            .map_err(|err| anyhow!("cannot create asset {uuid:#06x}: {err}"))?,
    };
    service
        .write(&caller, handle, args.offset, &payload)
        .map_err(|err| anyhow!("cannot write asset {uuid:#06x}: {err}"))?;
    save_flash(cli, service.store().flash())?;
    println!(
        "Wrote {len} bytes to asset {uuid:#06x} at offset {offset}.",
        len = payload.len(),
        offset = args.offset,
    );
    Ok(())
}

fn execute_get(cli: &Cli, args: &GetArgs) -> Result<()> {
    let uuid = parse_uuid(&args.uuid)?;
    let payload = fetch_asset(cli, uuid)?;
    match &args.out {
        Some(path) => {
            fs::write(path, &payload)
                .with_context(|| format!("cannot write '{}'", path.display()))?;
            println!(
                "Wrote {len} bytes of asset {uuid:#06x} to '{path}'.",
                len = payload.len(),
                path = path.display(),
            );
        }
        None => {
            println!("Asset {uuid:#06x} ({len} bytes):", len = payload.len());
            println!("  {data}", data = hex::encode(&payload));
        }
    }
    Ok(())
}

fn execute_delete(cli: &Cli, args: &AssetArgs) -> Result<()> {
    let uuid = parse_uuid(&args.uuid)?;
    let mut service = mount_service(cli, load_flash(cli)?)?;
    let caller = caller_for(cli);
    let handle = service
        .get_handle(&caller, uuid)
        .map_err(|err| anyhow!("no asset {uuid:#06x}: {err}"))?;
    service
        .delete(&caller, handle)
        .map_err(|err| anyhow!("cannot delete asset {uuid:#06x}: {err}"))?;
    save_flash(cli, service.store().flash())?;
    println!("Deleted asset {uuid:#06x}.");
    Ok(())
}

fn execute_info(cli: &Cli, args: &AssetArgs) -> Result<()> {
    let uuid = parse_uuid(&args.uuid)?;
    let mut service = mount_service(cli, load_flash(cli)?)?;
    let caller = caller_for(cli);
    let handle = service
        .get_handle(&caller, uuid)
        .map_err(|err| anyhow!("no asset {uuid:#06x}: {err}"))?;
    let info = service
        .store_mut()
        .attributes(handle)
        .map_err(|err| anyhow!("cannot stat asset {uuid:#06x}: {err}"))?;
    println!("Asset {uuid:#06x} ({name}):", name = asset_name(uuid));
    println!(
        "  {cur} of {max} bytes in use.",
        cur = info.cur_size,
        max = info.max_size,
    );
    if let Some(policy) = service.policy().lookup(uuid) {
        println!("  Access grants:");
        for grant in policy.grants {
            println!(
                "    - app {app}: {perms}",
                app = grant.app.0,
                perms = perms_text(grant.perms),
            );
        }
    }
    Ok(())
}

fn execute_inspect(cli: &Cli) -> Result<()> {
    let flash = load_flash(cli)?;
    println!(
        "Image '{path}': {blocks} blocks x {size} bytes.",
        path = cli.image.display(),
        blocks = flash.block_count(),
        size = flash.block_size(),
    );
    let mut service = mount_service(cli, flash)?;
    let geo = service.store().geometry();
    println!(
        "Store mounts cleanly: {mode}, {slots} object slots.",
        mode = if geo.encrypted { "encrypted" } else { "plaintext" },
        slots = geo.object_slots,
    );
    let entries = service
        .store_mut()
        .entries()
        .map_err(|err| anyhow!("cannot walk the object table: {err}"))?;
    let used: u32 = entries.iter().map(|(_, info)| info.cur_size).sum();
    println!(
        "  {count} slot(s) in use, {used} payload bytes.",
        count = entries.len(),
    );
    Ok(())
}

fn execute_export(cli: &Cli, args: &FileArgs) -> Result<()> {
    let mut service = mount_service(cli, load_flash(cli)?)?;
    let caller = caller_for(cli);
    let mut entries = service
        .store_mut()
        .entries()
        .map_err(|err| anyhow!("cannot walk the object table: {err}"))?;
    entries.sort_by_key(|(uuid, _)| *uuid);

    let mut assets = Vec::with_capacity(entries.len());
    for (uuid, info) in entries {
        let handle = service
            .get_handle(&caller, uuid)
            .map_err(|err| anyhow!("cannot open asset {uuid:#06x}: {err}"))?;
        let mut data = vec![0u8; info.cur_size as usize];
        if !data.is_empty() {
            service
                .read(&caller, handle, 0, &mut data)
                .map_err(|err| anyhow!("cannot read asset {uuid:#06x}: {err}"))?;
        }
        assets.push(AssetRecord { uuid, data });
    }
    let artifact = Artifact::new(assets);
    fs::write(&args.file, artifact.to_bytes()?)
        .with_context(|| format!("cannot write artifact '{}'", args.file.display()))?;
    println!(
        "Exported {count} asset(s) to '{path}'.",
        count = artifact.assets.len(),
        path = args.file.display(),
    );
    Ok(())
}

fn execute_import(cli: &Cli, args: &FileArgs) -> Result<()> {
    let bytes = fs::read(&args.file)
        .with_context(|| format!("cannot read artifact '{}'", args.file.display()))?;
    let artifact = Artifact::from_bytes(&bytes)?;

    let mut service = mount_service(cli, load_flash(cli)?)?;
    let caller = caller_for(cli);
    for record in &artifact.assets {
        let uuid = record.uuid;
        let handle = match service.get_handle(&caller, uuid) {
            Ok(handle) => handle,
            Err(_) => service
                .create(&caller, uuid)
                .map_err(|err| anyhow!("cannot create asset {uuid:#06x}: {err}"))?,
        };
        if !record.data.is_empty() {
            service
                .write(&caller, handle, 0, &record.data)
                .map_err(|err| anyhow!("cannot write asset {uuid:#06x}: {err}"))?;
        }
    }
    save_flash(cli, service.store().flash())?;
    println!(
        "Imported {count} asset(s) from '{path}'.",
        count = artifact.assets.len(),
        path = args.file.display(),
    );
    Ok(())
}

// ---- boot commands ----

fn execute_image_create(cli: &Cli, args: &ImageCreateArgs) -> Result<()> {
    let payload = fs::read(&args.payload)
        .with_context(|| format!("cannot read payload file '{}'", args.payload.display()))?;
    let version = parse_version(&args.version)?;
    let image = build_image(version, args.counter, &payload);
    fs::write(&cli.image, &image)
        .with_context(|| format!("cannot write image file '{}'", cli.image.display()))?;
    println!(
        "Built image {version} at '{path}' ({len} bytes, security counter {counter}).",
        path = cli.image.display(),
        len = image.len(),
        counter = args.counter,
    );
    Ok(())
}

fn execute_boot_install(cli: &Cli, args: &BootInstallArgs) -> Result<()> {
    let binary = fs::read(&args.binary)
        .with_context(|| format!("cannot read image binary '{}'", args.binary.display()))?;
    if binary.len() < ImageHeader::LEN as usize {
        bail!(
            "'{path}' is too short to hold an image header",
            path = args.binary.display(),
        );
    }
    let header = ImageHeader::decode(&binary[..ImageHeader::LEN as usize]);
    if !header.magic_ok() {
        bail!("'{path}' is not an image binary", path = args.binary.display());
    }

    let map = boot_map(&args.geo);
    let region = if args.secondary { map.secondary } else { map.primary };
    let trailer = Trailer::for_slot(region, args.geo.block_size);
    let capacity = region.len(args.geo.block_size) - trailer.total_len();
    if binary.len() as u32 > capacity {
        bail!(
            "image is {len} bytes but the slot holds at most {capacity}",
            len = binary.len(),
        );
    }

    let mut flash = load_boot_flash(cli, &args.geo, true)?;
    region.erase_blocks(&mut flash, 0, region.block_count)?;
    region.write(&mut flash, 0, &binary)?;
    save_flash(cli, &flash)?;
    println!(
        "Installed image {version} into the {slot} slot of '{path}'.",
        version = header.version,
        slot = if args.secondary { "secondary" } else { "primary" },
        path = cli.image.display(),
    );
    Ok(())
}

fn execute_boot_request(cli: &Cli, args: &BootRequestArgs) -> Result<()> {
    let mut flash = load_boot_flash(cli, &args.geo, false)?;
    let map = boot_map(&args.geo);
    let staged = read_slot_header(&mut flash, map.secondary)?;
    if !staged.magic_ok() {
        bail!("no image is staged in the secondary slot");
    }
    mark_pending(&mut flash, &map, args.permanent)
        .map_err(|err| anyhow!("cannot queue the swap: {err}"))?;
    save_flash(cli, &flash)?;
    println!(
        "Queued image {version} for a {mode} on the next boot.",
        version = staged.version,
        mode = if args.permanent { "permanent swap" } else { "test swap" },
    );
    Ok(())
}

fn execute_boot_confirm(cli: &Cli, args: &BootArgs) -> Result<()> {
    let mut flash = load_boot_flash(cli, args, false)?;
    let map = boot_map(args);
    mark_confirmed(&mut flash, &map)
        .map_err(|err| anyhow!("cannot confirm the running image: {err}"))?;
    save_flash(cli, &flash)?;
    println!("Confirmed the image in the primary slot.");
    Ok(())
}

fn execute_boot_status(cli: &Cli, args: &BootArgs) -> Result<()> {
    let mut flash = load_boot_flash(cli, args, false)?;
    let map = boot_map(args);
    println!(
        "Slot layout: 2 slots x {slot} blocks + {scratch} scratch block(s), {size}-byte blocks.",
        slot = args.slot_blocks,
        scratch = args.scratch_blocks,
        size = args.block_size,
    );

    let primary = read_slot_header(&mut flash, map.primary)?;
    let secondary = read_slot_header(&mut flash, map.secondary)?;
    println!("Primary  : {text}", text = slot_text(&primary));
    println!("Secondary: {text}", text = slot_text(&secondary));

    let primary_trailer = Trailer::for_slot(map.primary, args.block_size);
    let scratch_trailer = Trailer::for_scratch(map.scratch, args.block_size);
    let primary_state = primary_trailer.read_state(&mut flash)?;
    let secondary_state = Trailer::for_slot(map.secondary, args.block_size).read_state(&mut flash)?;
    let scratch_state = scratch_trailer.read_state(&mut flash)?;
    println!("Primary trailer  : {text}", text = state_text(&primary_state));
    println!("Secondary trailer: {text}", text = state_text(&secondary_state));
    println!("Scratch trailer  : {text}", text = state_text(&scratch_state));

    let source = status_source(&primary_state, &scratch_state);
    if source == StatusSource::None {
        let requested = requested_swap(&primary_state, &secondary_state);
        println!("Next boot: {text}.", text = swap_text(requested));
    } else {
        let trailer = match source {
            StatusSource::Scratch => scratch_trailer,
            _ => primary_trailer,
        };
        let mut bytes = vec![0u8; trailer.entries() as usize];
        trailer.read_status_bytes(&mut flash, &mut bytes)?;
        let (steps, _) = scan_status_bytes(&bytes);
        let status = BootStatus::from_steps(steps);
        println!(
            "Interrupted swap recorded in the {source:?} trailer: cycle {cycle}, step {step}.",
            cycle = status.idx,
            step = status.state,
        );
    }
    Ok(())
}

fn execute_boot_run(cli: &Cli, args: &BootArgs) -> Result<()> {
    let flash = load_boot_flash(cli, args, false)?;
    let map = boot_map(args);
    let mut loader = Bootloader::new(flash, map, Crc32Verifier::new(), RamCounter::new())
        .map_err(|err| anyhow!("cannot start the bootloader: {err}"))?;
    let outcome = loader.boot_go();
    // Swap work may have touched the device even when the boot failed.
    save_flash(cli, loader.flash())?;
    match outcome {
        Ok(response) => {
            println!(
                "Booting image {version} at offset {offset:#x} (security counter {counter}).",
                version = response.header.version,
                offset = response.image_offset,
                counter = response.header.security_counter,
            );
            Ok(())
        }
        Err(err) => bail!("boot failed: {err}"),
    }
}

// ---- store plumbing ----

fn load_flash(cli: &Cli) -> Result<SimFlash> {
    let bytes = fs::read(&cli.image)
        .with_context(|| format!("cannot read image file '{}'", cli.image.display()))?;
    SimFlash::from_image(cli.block_size, &bytes).ok_or_else(|| {
        anyhow!(
            "'{path}' is not a flash image with {size}-byte blocks",
            path = cli.image.display(),
            size = cli.block_size,
        )
    })
}

fn save_flash(cli: &Cli, flash: &SimFlash) -> Result<()> {
    fs::write(&cli.image, flash.image())
        .with_context(|| format!("cannot write image file '{}'", cli.image.display()))
}

fn mount_service(cli: &Cli, flash: SimFlash) -> Result<AssetService<'static, SimFlash>> {
    let geo = StoreGeometry {
        block_size: flash.block_size(),
        block_count: flash.block_count(),
        object_slots: cli.slots,
        encrypted: cli.passphrase.is_some(),
    };
    let mut service = AssetService::new(flash, geo, cipher_for(cli)?, catalog::CATALOG)
        .map_err(|err| anyhow!("cannot open the store: {err}"))?;
    service
        .prepare()
        .map_err(|err| anyhow!("store mount failed: {err}"))?;
    Ok(service)
}

fn cipher_for(cli: &Cli) -> Result<Option<EnvelopeCipher>> {
    let Some(passphrase) = &cli.passphrase else {
        return Ok(None);
    };
    let key = derive_key(passphrase.as_bytes(), cli.salt.as_bytes())?;
    let cipher = if cli.aes_gcm {
        EnvelopeCipher::aes256_gcm(*key)
    } else {
        EnvelopeCipher::chacha20_poly1305(*key)
    };
    Ok(Some(cipher))
}

fn caller_for(cli: &Cli) -> Caller {
    match cli.app {
        Some(app) => Caller::non_secure(AppId(app)),
        None => Caller::secure(),
    }
}

/// Stretches a passphrase into an envelope key.
fn derive_key(passphrase: &[u8], salt: &[u8]) -> Result<Zeroizing<[u8; 32]>> {
    let params = scrypt::Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P)
        .map_err(|err| anyhow!("scrypt parameters rejected: {err}"))?;
    let mut key = Zeroizing::new([0u8; 32]);
    scrypt::scrypt(passphrase, salt, &params, key.as_mut())
        .map_err(|err| anyhow!("key derivation failed: {err}"))?;
    Ok(key)
}

/// Reads an asset's full payload out of the image file.
fn fetch_asset(cli: &Cli, uuid: u16) -> Result<Vec<u8>> {
    let mut service = mount_service(cli, load_flash(cli)?)?;
    let caller = caller_for(cli);
    let handle = service
        .get_handle(&caller, uuid)
        .map_err(|err| anyhow!("no asset {uuid:#06x}: {err}"))?;
    let info = service
        .store_mut()
        .attributes(handle)
        .map_err(|err| anyhow!("cannot stat asset {uuid:#06x}: {err}"))?;
    let mut payload = vec![0u8; info.cur_size as usize];
    if !payload.is_empty() {
        service
            .read(&caller, handle, 0, &mut payload)
            .map_err(|err| anyhow!("cannot read asset {uuid:#06x}: {err}"))?;
    }
    Ok(payload)
}

fn read_payload(args: &PutArgs) -> Result<Vec<u8>> {
    match (&args.file, &args.hex) {
        (Some(path), None) => fs::read(path)
            .with_context(|| format!("cannot read payload file '{}'", path.display())),
        (None, Some(text)) => {
            hex::decode(text.trim()).map_err(|_| anyhow!("--hex payload is not valid hex"))
        }
        (None, None) => bail!("pass --file or --hex with the payload"),
        (Some(_), Some(_)) => bail!("--file and --hex are mutually exclusive"),
    }
}

/// Parses a uuid written as decimal or 0x-prefixed hex.
fn parse_uuid(text: &str) -> Result<u16> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(digits) => u16::from_str_radix(digits, 16),
        None => text.parse(),
    };
    parsed.map_err(|_| anyhow!("'{text}' is not a valid asset uuid"))
}

// ---- boot plumbing ----

fn boot_map(geo: &BootArgs) -> SlotMap {
    SlotMap::new(
        Region::new(0, geo.slot_blocks),
        Region::new(geo.slot_blocks, geo.slot_blocks),
        Region::new(2 * geo.slot_blocks, geo.scratch_blocks),
    )
}

/// Mounts the boot image file. `create` allows a missing file, which
/// mounts as a fully erased device.
fn load_boot_flash(cli: &Cli, geo: &BootArgs, create: bool) -> Result<SimFlash> {
    let wanted = 2 * geo.slot_blocks + geo.scratch_blocks;
    if !cli.image.exists() {
        if create {
            return Ok(SimFlash::new(geo.block_size, wanted));
        }
        bail!("no image file at '{}'", cli.image.display());
    }
    let bytes = fs::read(&cli.image)
        .with_context(|| format!("cannot read image file '{}'", cli.image.display()))?;
    let flash = SimFlash::from_image(geo.block_size, &bytes).ok_or_else(|| {
        anyhow!(
            "'{path}' is not a flash image with {size}-byte blocks",
            path = cli.image.display(),
            size = geo.block_size,
        )
    })?;
    if flash.block_count() != wanted {
        bail!(
            "image has {got} blocks but the slot layout needs {wanted}",
            got = flash.block_count(),
        );
    }
    Ok(flash)
}

/// Reads and decodes the image header at the start of a slot.
fn read_slot_header(flash: &mut SimFlash, region: Region) -> Result<ImageHeader> {
    let mut bytes = [0u8; ImageHeader::LEN as usize];
    region.read(flash, 0, &mut bytes)?;
    Ok(ImageHeader::decode(&bytes))
}

/// Parses an image version written as `major.minor.revision+build`.
fn parse_version(text: &str) -> Result<ImageVersion> {
    let (core, build) = match text.split_once('+') {
        Some((core, build)) => (core, build),
        None => (text, "0"),
    };
    let fields: Vec<&str> = core.split('.').collect();
    let &[major, minor, revision] = &fields[..] else {
        bail!("'{text}' is not a major.minor.revision+build version");
    };
    Ok(ImageVersion {
        major: major
            .parse()
            .map_err(|_| anyhow!("bad major version '{major}'"))?,
        minor: minor
            .parse()
            .map_err(|_| anyhow!("bad minor version '{minor}'"))?,
        revision: revision
            .parse()
            .map_err(|_| anyhow!("bad revision '{revision}'"))?,
        build: build
            .parse()
            .map_err(|_| anyhow!("bad build number '{build}'"))?,
    })
}

// ---- output helpers ----

fn asset_name(uuid: u16) -> &'static str {
    match uuid {
        catalog::AES_KEY_128 => "aes-key-128",
        catalog::AES_KEY_192 => "aes-key-192",
        catalog::AES_KEY_256 => "aes-key-256",
        catalog::RSA_KEY_1024 => "rsa-key-1024",
        catalog::RSA_KEY_2048 => "rsa-key-2048",
        catalog::RSA_KEY_4096 => "rsa-key-4096",
        catalog::X509_CERT_SMALL => "x509-cert-small",
        catalog::X509_CERT_LARGE => "x509-cert-large",
        catalog::SHA224_HASH => "sha224-hash",
        catalog::SHA384_HASH => "sha384-hash",
        _ => "(unnamed)",
    }
}

fn perms_text(perms: Perms) -> String {
    let mut parts = Vec::new();
    if perms.allows(Perms::REFERENCE) {
        parts.push("reference");
    }
    if perms.allows(Perms::READ) {
        parts.push("read");
    }
    if perms.allows(Perms::WRITE) {
        parts.push("write");
    }
    if parts.is_empty() {
        parts.push("none");
    }
    parts.join("+")
}

fn slot_text(header: &ImageHeader) -> String {
    if header.is_erased() {
        "(erased)".to_string()
    } else if !header.magic_ok() {
        "(unrecognized contents)".to_string()
    } else {
        format!(
            "image {version}, security counter {counter}, {len} bytes",
            version = header.version,
            counter = header.security_counter,
            len = header.extent(),
        )
    }
}

fn state_text(state: &SwapState) -> String {
    format!(
        "magic {magic:?}, image_ok {image_ok:?}, copy_done {copy_done:?}",
        magic = state.magic,
        image_ok = state.image_ok,
        copy_done = state.copy_done,
    )
}

fn swap_text(swap: SwapType) -> &'static str {
    match swap {
        SwapType::None => "none",
        SwapType::Test => "test swap",
        SwapType::Perm => "permanent swap",
        SwapType::Revert => "revert",
        SwapType::Fail => "none (previous swap failed)",
    }
}

// ---- tests ----

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Builds the Cli that `redoubt --image <path> ...` would produce.
    fn cli_for(image: PathBuf) -> Cli {
        Cli {
            image,
            block_size: 4096,
            blocks: 5,
            slots: 10,
            passphrase: None,
            salt: DEFAULT_SALT.to_string(),
            aes_gcm: false,
            app: None,
            command: Command::Inspect,
        }
    }

    fn put_hex(cli: &Cli, uuid: &str, hex: &str) -> Result<()> {
        execute_put(
            cli,
            &PutArgs {
                uuid: uuid.to_string(),
                file: None,
                hex: Some(hex.to_string()),
                offset: 0,
            },
        )
    }

    #[test]
    fn uuids_parse_in_decimal_and_hex() {
        assert_eq!(parse_uuid("11").unwrap(), 11);
        assert_eq!(parse_uuid("0x0b").unwrap(), 11);
        assert_eq!(parse_uuid("0X0B").unwrap(), 11);
        assert!(parse_uuid("banana").is_err());
        assert!(parse_uuid("0x10000").is_err());
    }

    #[test]
    fn versions_parse_with_and_without_build() {
        let version = parse_version("1.2.300+7").unwrap();
        assert_eq!(
            (version.major, version.minor, version.revision, version.build),
            (1, 2, 300, 7)
        );
        assert_eq!(parse_version("2.0.1").unwrap().build, 0);
        assert!(parse_version("2.0").is_err());
        assert!(parse_version("a.b.c").is_err());
    }

    #[test]
    fn key_derivation_is_deterministic_and_salted() {
        let one = derive_key(b"pass", b"salt-a").unwrap();
        let two = derive_key(b"pass", b"salt-a").unwrap();
        let other = derive_key(b"pass", b"salt-b").unwrap();
        assert_eq!(*one, *two);
        assert_ne!(*one, *other);
    }

    #[test]
    fn store_assets_round_trip_through_the_image_file() {
        let dir = TempDir::new().unwrap();
        let cli = cli_for(dir.path().join("store.bin"));
        execute_init(&cli, &InitArgs { force: false }).unwrap();

        put_hex(&cli, "0x0b", "a1b2c3").unwrap();
        assert_eq!(fetch_asset(&cli, 0x0b).unwrap(), vec![0xa1, 0xb2, 0xc3]);

        // An offset write patches the payload in place.
        execute_put(
            &cli,
            &PutArgs {
                uuid: "11".to_string(),
                file: None,
                hex: Some("ff".to_string()),
                offset: 1,
            },
        )
        .unwrap();
        assert_eq!(fetch_asset(&cli, 11).unwrap(), vec![0xa1, 0xff, 0xc3]);

        execute_delete(
            &cli,
            &AssetArgs {
                uuid: "11".to_string(),
            },
        )
        .unwrap();
        assert!(fetch_asset(&cli, 11).is_err());

        // A second init refuses to clobber the file unless forced.
        assert!(execute_init(&cli, &InitArgs { force: false }).is_err());
        execute_init(&cli, &InitArgs { force: true }).unwrap();
        assert!(fetch_asset(&cli, 11).is_err());
    }

    #[test]
    fn encrypted_store_rejects_the_wrong_passphrase() {
        let dir = TempDir::new().unwrap();
        let mut cli = cli_for(dir.path().join("vault.bin"));
        cli.passphrase = Some("correct horse".to_string());
        execute_init(&cli, &InitArgs { force: false }).unwrap();
        put_hex(&cli, "3", "00112233445566778899aabbccddeeff").unwrap();
        assert_eq!(fetch_asset(&cli, 3).unwrap().len(), 16);

        let mut wrong = cli.clone();
        wrong.passphrase = Some("battery staple".to_string());
        assert!(fetch_asset(&wrong, 3).is_err());
    }

    #[test]
    fn application_grants_gate_asset_access() {
        let dir = TempDir::new().unwrap();
        let mut cli = cli_for(dir.path().join("store.bin"));
        execute_init(&cli, &InitArgs { force: false }).unwrap();

        // App 9 owns the AES keys, app 10 has no grant on them.
        cli.app = Some(9);
        put_hex(&cli, "3", &"aa".repeat(16)).unwrap();
        cli.app = Some(10);
        assert!(fetch_asset(&cli, 3).is_err());
        cli.app = None;
        assert_eq!(fetch_asset(&cli, 3).unwrap().len(), 16);
    }

    #[test]
    fn export_then_import_recreates_the_assets() {
        let dir = TempDir::new().unwrap();
        let cli_a = cli_for(dir.path().join("a.bin"));
        execute_init(&cli_a, &InitArgs { force: false }).unwrap();
        put_hex(&cli_a, "3", &"5c".repeat(16)).unwrap();
        put_hex(&cli_a, "11", "012345").unwrap();

        let artifact_path = dir.path().join("assets.cbor");
        execute_export(
            &cli_a,
            &FileArgs {
                file: artifact_path.clone(),
            },
        )
        .unwrap();

        let cli_b = cli_for(dir.path().join("b.bin"));
        execute_init(&cli_b, &InitArgs { force: false }).unwrap();
        execute_import(
            &cli_b,
            &FileArgs {
                file: artifact_path,
            },
        )
        .unwrap();
        assert_eq!(fetch_asset(&cli_b, 3).unwrap(), vec![0x5c; 16]);
        assert_eq!(fetch_asset(&cli_b, 11).unwrap(), vec![0x01, 0x23, 0x45]);
    }

    #[test]
    fn staged_image_flows_through_install_request_and_boot() {
        let dir = TempDir::new().unwrap();
        let payload_path = dir.path().join("payload.bin");
        fs::write(&payload_path, vec![0x5au8; 700]).unwrap();
        let geo = BootArgs {
            block_size: 512,
            slot_blocks: 4,
            scratch_blocks: 1,
        };

        // Build two image binaries from the same payload.
        let bin_a = dir.path().join("one.img");
        let bin_b = dir.path().join("two.img");
        execute_image_create(
            &cli_for(bin_a.clone()),
            &ImageCreateArgs {
                payload: payload_path.clone(),
                version: "1.0.0+1".to_string(),
                counter: 0,
            },
        )
        .unwrap();
        execute_image_create(
            &cli_for(bin_b.clone()),
            &ImageCreateArgs {
                payload: payload_path.clone(),
                version: "2.0.0+1".to_string(),
                counter: 1,
            },
        )
        .unwrap();
        let built = fs::read(&bin_a).unwrap();
        let built_header = ImageHeader::decode(&built[..ImageHeader::LEN as usize]);
        assert_eq!(built_header.version, parse_version("1.0.0+1").unwrap());

        // Install the first image, boot it, then stage and swap in the second.
        let cli = cli_for(dir.path().join("device.bin"));
        execute_boot_install(
            &cli,
            &BootInstallArgs {
                geo: geo.clone(),
                binary: bin_a.clone(),
                secondary: false,
            },
        )
        .unwrap();
        execute_boot_run(&cli, &geo).unwrap();

        execute_boot_install(
            &cli,
            &BootInstallArgs {
                geo: geo.clone(),
                binary: bin_b.clone(),
                secondary: true,
            },
        )
        .unwrap();
        execute_boot_request(
            &cli,
            &BootRequestArgs {
                geo: geo.clone(),
                permanent: true,
            },
        )
        .unwrap();
        execute_boot_run(&cli, &geo).unwrap();

        let image = fs::read(dir.path().join("device.bin")).unwrap();
        let header = ImageHeader::decode(&image[..ImageHeader::LEN as usize]);
        assert_eq!(header.version, parse_version("2.0.0+1").unwrap());

        // The swap settles; another boot leaves the device unchanged.
        execute_boot_status(&cli, &geo).unwrap();
        execute_boot_run(&cli, &geo).unwrap();
        let again = fs::read(dir.path().join("device.bin")).unwrap();
        assert_eq!(again, image);
    }
}
