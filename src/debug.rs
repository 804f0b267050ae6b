use crate::chunk::{Chunk, OpCode};
use crate::value::{as_object, format_value};

pub fn disassemble_chunk(chunk: &Chunk, name: &str) {
    println!("== {} ==", name);

    let mut offset = 0;
    while offset < chunk.len() {
        offset = disassemble_instruction(chunk, offset);
    }
}

pub fn disassemble_instruction(chunk: &Chunk, offset: usize) -> usize {
    print!("{:04} ", offset);
    if offset > 0 && chunk.line_at(offset) == chunk.line_at(offset - 1) {
        print!("   | ");
    } else {
        print!("{:4} ", chunk.line_at(offset));
    }

    let Some(instruction) = OpCode::from_byte(chunk.code[offset]) else {
        println!("Unknown opcode {}", chunk.code[offset]);
        return offset + 1;
    };

    match instruction {
        OpCode::Nil
        | OpCode::True
        | OpCode::False
        | OpCode::Pop
        | OpCode::Equal
        | OpCode::Greater
        | OpCode::Less
        | OpCode::Add
        | OpCode::Subtract
        | OpCode::Multiply
        | OpCode::Divide
        | OpCode::Not
        | OpCode::Negate
        | OpCode::CloseUpvalue
        | OpCode::Return
        | OpCode::GetField
        | OpCode::SetField
        | OpCode::Coroutine
        | OpCode::Yield
        | OpCode::Await => simple_instruction(instruction, offset),

        OpCode::Constant | OpCode::GetGlobal | OpCode::SetGlobal => {
            constant_instruction(instruction, chunk, offset, false)
        }
        OpCode::ConstantLong | OpCode::GetGlobalLong | OpCode::SetGlobalLong => {
            constant_instruction(instruction, chunk, offset, true)
        }

        OpCode::GetLocal
        | OpCode::SetLocal
        | OpCode::GetUpvalue
        | OpCode::SetUpvalue
        | OpCode::Call
        | OpCode::List
        | OpCode::Dict => byte_instruction(instruction, chunk, offset),

        OpCode::GetLocalLong | OpCode::SetLocalLong | OpCode::ListLong | OpCode::DictLong => {
            long_operand_instruction(instruction, chunk, offset)
        }

        OpCode::Jump | OpCode::JumpIfFalse => jump_instruction(instruction, 1, chunk, offset),
        OpCode::Loop => jump_instruction(instruction, -1, chunk, offset),

        OpCode::Closure => closure_instruction(instruction, chunk, offset, false),
        OpCode::ClosureLong => closure_instruction(instruction, chunk, offset, true),
    }
}

fn simple_instruction(instruction: OpCode, offset: usize) -> usize {
    println!("{}", instruction);
    offset + 1
}

fn read_index(chunk: &Chunk, offset: usize, long: bool) -> (usize, usize) {
    if long {
        let index = chunk.code[offset] as usize
            | (chunk.code[offset + 1] as usize) << 8
            | (chunk.code[offset + 2] as usize) << 16;
        (index, 3)
    } else {
        (chunk.code[offset] as usize, 1)
    }
}

fn constant_instruction(instruction: OpCode, chunk: &Chunk, offset: usize, long: bool) -> usize {
    let (index, width) = read_index(chunk, offset + 1, long);
    let constant = chunk.get_constant(index);
    println!("{:<16} {:>4} '{}'", instruction.to_string(), index, format_value(&constant));
    offset + 1 + width
}

fn byte_instruction(instruction: OpCode, chunk: &Chunk, offset: usize) -> usize {
    println!("{:<16} {:>4}", instruction.to_string(), chunk.code[offset + 1]);
    offset + 2
}

fn long_operand_instruction(instruction: OpCode, chunk: &Chunk, offset: usize) -> usize {
    let (operand, width) = read_index(chunk, offset + 1, true);
    println!("{:<16} {:>4}", instruction.to_string(), operand);
    offset + 1 + width
}

fn jump_instruction(instruction: OpCode, sign: i64, chunk: &Chunk, offset: usize) -> usize {
    let jump = (chunk.code[offset + 1] as u32) << 24
        | (chunk.code[offset + 2] as u32) << 16
        | (chunk.code[offset + 3] as u32) << 8
        | chunk.code[offset + 4] as u32;
    let target = offset as i64 + 5 + sign * jump as i64;
    println!("{:<16} {:>4} -> {}", instruction.to_string(), offset, target);
    offset + 5
}

fn closure_instruction(instruction: OpCode, chunk: &Chunk, offset: usize, long: bool) -> usize {
    let (index, width) = read_index(chunk, offset + 1, long);
    let constant = chunk.get_constant(index);
    println!("{:<16} {:>4} {}", instruction.to_string(), index, format_value(&constant));

    let function = as_object(&constant);
    let upvalue_count = unsafe { (*function).as_function().upvalue_count };
    let mut next = offset + 1 + width;
    for _ in 0..upvalue_count {
        let is_local = chunk.code[next];
        let slot = chunk.code[next + 1];
        println!(
            "{:04}    |                     {} {}",
            next,
            if is_local == 1 { "local" } else { "upvalue" },
            slot
        );
        next += 2;
    }
    next
}
