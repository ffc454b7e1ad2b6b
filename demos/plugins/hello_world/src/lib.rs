use std::ffi::{c_void, CStr};
use std::os::raw::{c_char, c_int};

use hearth::abi::{
    guard_status, guard_with_default, Capability, CapabilityId, PLUGIN_INIT_SYMBOL,
    PLUGIN_MAIN_SYMBOL,
};
use hearth::manifest::manifest_from_raw;

/// Greeting capability provided by this module. Hosts that want to create
/// greeters declare the same capability.
pub trait Greeter: Send {
    fn greet(&self, who: &str) -> String;
}

pub struct GreeterCapability;

impl Capability for GreeterCapability {
    const ID: CapabilityId = CapabilityId::new(0x6772_6565_7465_7200, 1);
    const NAME: &'static str = "greeter";
    const BUILDER_SYMBOL: &'static str = "hearth_manifest_greeter";
    type Object = dyn Greeter;
}

struct Plain;

impl Greeter for Plain {
    fn greet(&self, who: &str) -> String {
        format!("Hello, {who}!")
    }
}

struct Shouting;

impl Greeter for Shouting {
    fn greet(&self, who: &str) -> String {
        format!("HELLO, {}!", who.to_uppercase())
    }
}

static SHOUTING: Shouting = Shouting;

fn create_plain() -> Option<Box<dyn Greeter>> {
    Some(Box::new(Plain))
}

fn shouting() -> &'static dyn Greeter {
    &SHOUTING
}

/// Set to make the init hook panic.
pub const PANIC_INIT_ENV: &str = "HEARTH_HELLO_PANIC_INIT";

/// Populate the greeter manifest
///
/// # Safety
/// Called by the host with the manifest matching `id`.
#[no_mangle]
pub unsafe extern "C" fn hearth_manifest_greeter(abi: u64, id: CapabilityId, raw: *mut c_void) -> bool {
    guard_with_default(GreeterCapability::BUILDER_SYMBOL, false, || {
        let Some(manifest) = manifest_from_raw::<GreeterCapability>(abi, id, raw) else {
            return false;
        };
        manifest.register_factory("plain", create_plain).is_ok()
            && manifest.register_singleton("shouting", shouting).is_ok()
    })
}

/// Initialize plugin
#[no_mangle]
pub extern "C" fn hearth_plugin_init() -> c_int {
    guard_status(PLUGIN_INIT_SYMBOL, || {
        if std::env::var_os(PANIC_INIT_ENV).is_some() {
            panic!("{PANIC_INIT_ENV} is set");
        }
        eprintln!("[Hello World Plugin] Initialized!");
        0
    })
}

/// Get plugin name
#[no_mangle]
pub extern "C" fn hearth_plugin_name() -> *const c_char {
    c"hello".as_ptr()
}

/// Get plugin version
#[no_mangle]
pub extern "C" fn hearth_plugin_version() -> *const c_char {
    c"0.1.0".as_ptr()
}

#[no_mangle]
pub extern "C" fn hearth_plugin_author() -> *const c_char {
    c"RyAnPr1Me".as_ptr()
}

#[no_mangle]
pub extern "C" fn hearth_plugin_description() -> *const c_char {
    c"A simple example plugin demonstrating the plugin API".as_ptr()
}

/// Host version prefix this plugin was built against
#[no_mangle]
pub extern "C" fn hearth_plugin_compatibility() -> *const c_char {
    c"1.".as_ptr()
}

#[no_mangle]
pub extern "C" fn hearth_plugin_subcommands() -> *const c_char {
    c"[\"greet\"]".as_ptr()
}

#[no_mangle]
pub extern "C" fn hearth_plugin_features() -> *const c_char {
    c"[\"greeter\"]".as_ptr()
}

/// Handle command
#[no_mangle]
pub unsafe extern "C" fn hearth_plugin_main(argc: c_int, argv: *const *const c_char) -> c_int {
    guard_status(PLUGIN_MAIN_SYMBOL, || run(argc, argv))
}

unsafe fn run(argc: c_int, argv: *const *const c_char) -> c_int {
    let args: Vec<String> = (0..usize::try_from(argc).unwrap_or(0))
        .map(|i| CStr::from_ptr(*argv.add(i)).to_string_lossy().into_owned())
        .collect();

    // Invoked either as `hello <command> ..` or directly as `greet ..`.
    let (command, rest) = match args.first().map(String::as_str) {
        Some("greet") => ("greet", args.get(1..).unwrap_or(&[])),
        _ => (
            args.get(1).map_or("hello", String::as_str),
            args.get(2..).unwrap_or(&[]),
        ),
    };
    let who = rest.first().map_or("world", String::as_str);

    match command {
        "hello" => println!("{}", Plain.greet("hearth")),
        "greet" => println!("{}", Plain.greet(who)),
        "shout" => println!("{}", SHOUTING.greet(who)),
        "fault" => panic!("fault requested"),
        "help" => println!(
            "Available commands:\n  hello        - Say hello\n  greet <who>  - Greet someone\n  shout <who>  - Greet loudly\n  fault        - Panic inside the plugin"
        ),
        other => {
            eprintln!("Unknown command: {other}");
            return 2;
        }
    }
    0
}
