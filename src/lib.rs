#[macro_use]
extern crate tracing;

mod app;
pub mod logging;

pub use app::App;
use color_eyre::Result;
pub use flood_config::Args;
pub use logging::init_logging;

/// Installs the error report and panic hooks. Release builds print a crash report
/// file instead of a backtrace.
pub fn init_errors() -> Result<()> {
    let (panic_hook, eyre_hook) = color_eyre::config::HookBuilder::default()
        .display_location_section(cfg!(debug_assertions))
        .into_hooks();
    eyre_hook.install()?;

    std::panic::set_hook(Box::new(move |panic_info| {
        #[cfg(not(debug_assertions))]
        {
            use human_panic::{
                handle_dump,
                metadata,
                print_msg,
            };
            let metadata = metadata!();
            let file_path = handle_dump(&metadata, panic_info);
            print_msg(file_path, &metadata).expect("human-panic: printing error message to console failed");
            eprintln!("{}", panic_hook.panic_report(panic_info));
        }
        #[cfg(debug_assertions)]
        {
            eprintln!("{}", panic_hook.panic_report(panic_info));
            better_panic::Settings::auto()
                .most_recent_first(false)
                .lineno_suffix(true)
                .verbosity(better_panic::Verbosity::Full)
                .create_panic_handler()(panic_info);
        }

        error!("Process panicked: {panic_info}");
    }));

    Ok(())
}
