use std::process;

fn main() {
    std::panic::set_hook(Box::new(turborepo_lib::cli::panic_handler));

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("unable to start tokio runtime");

    let exit_code = rt.block_on(turborepo_lib::cli::main());

    process::exit(exit_code);
}
