pub mod decomp;
