use chainlib::consensus;
use chainlib::util::Saveable;
use std::env;
use std::process::exit;

// writes the network's genesis block so operators can compare it across nodes
fn main() {
    let path = if let Some(arg) = env::args().nth(1) {
        arg
    } else {
        eprintln!("Usage: block_gen <output_block_file_path>");
        exit(1);
    };
    let block = consensus::init_block();
    if let Err(e) = block.save_to_file(&path) {
        eprintln!("Failed to save block: {e}");
        exit(1);
    }
    println!("genesis {} written to {}", block.hash(), path);
}
