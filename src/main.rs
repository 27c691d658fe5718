use lpr_check::{Verdict, Verifier};
use std::env;
use std::process;

fn main() {
    let mut args = env::args().skip(1);
    let (cnf_path, proof_path) = match (args.next(), args.next()) {
        (Some(cnf), Some(proof)) => (cnf, proof),
        _ => {
            eprintln!("usage: lpr-check <formula.cnf> <proof.lpr>");
            process::exit(255);
        }
    };

    let mut verifier = Verifier::from_dimacs(&cnf_path).unwrap_or_else(|e| {
        println!("c {e}");
        process::exit(e.exit_code());
    });

    match verifier.check_proof(&proof_path) {
        Ok(Verdict::Verified) => {
            println!("s VERIFIED");
            process::exit(1);
        }
        Ok(Verdict::NotVerified) => {
            println!("s NOT VERIFIED");
            process::exit(0);
        }
        Err(e) => {
            println!("c {e}");
            process::exit(e.exit_code());
        }
    }
}
