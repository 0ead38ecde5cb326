mod interp;
mod opcode;
