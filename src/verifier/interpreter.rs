//! Per-opcode effects on a [`FrameState`]
//!
//! This is stack-effect simulation, not verification: operands are popped
//! and results pushed according to each opcode's contract, and the only
//! failures are the ones that make frame computation impossible (underflow,
//! bad widths, bad local indices). Whether the popped types were *legal* is
//! the JVM verifier's job, not this engine's.

use crate::code::{
    BranchInstruction, ConstantData, Label, SymbolicInstruction,
};
use crate::descriptors::{ArrayType, FieldType, RefType};
use crate::errors::FrameErrorKind;
use crate::names::{BinaryName, UnqualifiedName};
use crate::util::{Offset, Width};
use crate::verifier::{FrameState, UninitializedSite, VType, VerificationType};

/// Where in the method the instruction being simulated sits
pub struct InsnContext<'a> {
    /// Class whose method is being simulated (`<init>` turns
    /// `UninitializedThis` into this)
    pub this_class: &'a BinaryName,

    /// Basic block being simulated
    pub block: Label,

    /// Offset of the instruction from the start of its block
    pub offset_in_block: Offset,
}

/// Update the frame to reflect the effects of a non-branching instruction
pub fn execute(
    insn: &SymbolicInstruction,
    frame: &mut FrameState,
    ctx: &InsnContext<'_>,
) -> Result<(), FrameErrorKind> {
    use crate::code::Instruction::*;
    use VerificationType::*;

    match insn {
        Nop => (),
        AConstNull => frame.push(Null),
        IConstM1 | IConst0 | IConst1 | IConst2 | IConst3 | IConst4 | IConst5 | BiPush(_)
        | SiPush(_) => frame.push(Integer),
        LConst0 | LConst1 => frame.push(Long),
        FConst0 | FConst1 | FConst2 => frame.push(Float),
        DConst0 | DConst1 => frame.push(Double),

        Ldc(constant) => frame.push(match constant {
            ConstantData::Integer(_) => Integer,
            ConstantData::Float(_) => Float,
            ConstantData::String(_) => Object(RefType::Object(BinaryName::STRING)),
            ConstantData::Class(_) => Object(RefType::Object(BinaryName::CLASS)),
            ConstantData::MethodHandle(_) => Object(RefType::Object(BinaryName::METHOD_HANDLE)),
            ConstantData::MethodType(_) => Object(RefType::Object(BinaryName::METHOD_TYPE)),
            ConstantData::Dynamic(dynamic) => {
                let vtype = VType::from(&dynamic.descriptor);
                if vtype.width() != 1 {
                    return Err(FrameErrorKind::InvalidWidth(2));
                }
                vtype
            }
            ConstantData::Long(_) | ConstantData::Double(_) => {
                return Err(FrameErrorKind::InvalidWidth(2))
            }
        }),
        Ldc2(constant) => frame.push(match constant {
            ConstantData::Long(_) => Long,
            ConstantData::Double(_) => Double,
            ConstantData::Dynamic(dynamic) => {
                let vtype = VType::from(&dynamic.descriptor);
                if vtype.width() != 2 {
                    return Err(FrameErrorKind::InvalidWidth(1));
                }
                vtype
            }
            _ => return Err(FrameErrorKind::InvalidWidth(1)),
        }),

        ILoad(index) => {
            frame.get_local(*index)?;
            frame.push(Integer);
        }
        LLoad(index) => {
            frame.get_local(*index)?;
            frame.push(Long);
        }
        FLoad(index) => {
            frame.get_local(*index)?;
            frame.push(Float);
        }
        DLoad(index) => {
            frame.get_local(*index)?;
            frame.push(Double);
        }
        ALoad(index) => {
            let vtype = frame.get_local(*index)?;
            frame.push(vtype);
        }

        IALoad | BALoad | CALoad | SALoad => {
            frame.pop()?;
            frame.pop()?;
            frame.push(Integer);
        }
        LALoad => {
            frame.pop()?;
            frame.pop()?;
            frame.push(Long);
        }
        FALoad => {
            frame.pop()?;
            frame.pop()?;
            frame.push(Float);
        }
        DALoad => {
            frame.pop()?;
            frame.pop()?;
            frame.push(Double);
        }
        AALoad => {
            frame.pop()?;
            let array_type = frame.pop()?;
            frame.push(match array_type {
                // Loading from the null array faults at runtime; until then
                // the result can stand in for any reference
                Null => Null,
                Object(RefType::ObjectArray(arr)) => match arr.additional_dimensions {
                    0 => Object(RefType::Object(arr.element_type)),
                    more => Object(RefType::ObjectArray(ArrayType {
                        additional_dimensions: more - 1,
                        element_type: arr.element_type,
                    })),
                },
                other => {
                    log::error!("aaload from non-array type {:?}", other);
                    return Err(FrameErrorKind::InvalidType);
                }
            });
        }

        IStore(index) => {
            frame.pop_width(1)?;
            frame.set_local(*index, Integer);
        }
        FStore(index) => {
            frame.pop_width(1)?;
            frame.set_local(*index, Float);
        }
        LStore(index) => {
            frame.pop_width(2)?;
            frame.set_local(*index, Long);
        }
        DStore(index) => {
            frame.pop_width(2)?;
            frame.set_local(*index, Double);
        }
        AStore(index) => {
            let vtype = frame.pop_width(1)?;
            frame.set_local(*index, vtype);
        }

        IAStore | BAStore | CAStore | SAStore | FAStore | AAStore => {
            frame.pop()?;
            frame.pop()?;
            frame.pop()?;
        }
        LAStore | DAStore => {
            frame.pop_width(2)?;
            frame.pop()?;
            frame.pop()?;
        }

        Pop => {
            frame.pop_width(1)?;
        }
        Pop2 => {
            let top = frame.pop()?;
            if top.width() == 1 {
                frame.pop_width(1)?;
            }
        }
        Dup => {
            let arg1 = frame.pop_width(1)?;
            frame.push(arg1.clone());
            frame.push(arg1);
        }
        DupX1 => {
            let arg1 = frame.pop_width(1)?;
            let arg2 = frame.pop_width(1)?;
            frame.push(arg1.clone());
            frame.push(arg2);
            frame.push(arg1);
        }
        DupX2 => {
            let arg1 = frame.pop_width(1)?;
            let arg2 = frame.pop()?;
            match arg2.width() {
                1 => {
                    let arg3 = frame.pop_width(1)?;
                    frame.push(arg1.clone());
                    frame.push(arg3);
                    frame.push(arg2);
                    frame.push(arg1);
                }
                _ => {
                    frame.push(arg1.clone());
                    frame.push(arg2);
                    frame.push(arg1);
                }
            }
        }
        Dup2 => {
            let arg1 = frame.pop()?;
            match arg1.width() {
                1 => {
                    let arg2 = frame.pop_width(1)?;
                    frame.push(arg2.clone());
                    frame.push(arg1.clone());
                    frame.push(arg2);
                    frame.push(arg1);
                }
                _ => {
                    frame.push(arg1.clone());
                    frame.push(arg1);
                }
            }
        }
        Dup2X1 => {
            let arg1 = frame.pop()?;
            match arg1.width() {
                1 => {
                    let arg2 = frame.pop_width(1)?;
                    let arg3 = frame.pop_width(1)?;
                    frame.push(arg2.clone());
                    frame.push(arg1.clone());
                    frame.push(arg3);
                    frame.push(arg2);
                    frame.push(arg1);
                }
                _ => {
                    let arg2 = frame.pop_width(1)?;
                    frame.push(arg1.clone());
                    frame.push(arg2);
                    frame.push(arg1);
                }
            }
        }
        Dup2X2 => {
            let arg1 = frame.pop()?;
            match arg1.width() {
                1 => {
                    let arg2 = frame.pop_width(1)?;
                    let arg3 = frame.pop()?;
                    match arg3.width() {
                        1 => {
                            let arg4 = frame.pop_width(1)?;
                            frame.push(arg2.clone());
                            frame.push(arg1.clone());
                            frame.push(arg4);
                            frame.push(arg3);
                            frame.push(arg2);
                            frame.push(arg1);
                        }
                        _ => {
                            frame.push(arg2.clone());
                            frame.push(arg1.clone());
                            frame.push(arg3);
                            frame.push(arg2);
                            frame.push(arg1);
                        }
                    }
                }
                _ => {
                    let arg2 = frame.pop()?;
                    match arg2.width() {
                        1 => {
                            let arg3 = frame.pop_width(1)?;
                            frame.push(arg1.clone());
                            frame.push(arg3);
                            frame.push(arg2);
                            frame.push(arg1);
                        }
                        _ => {
                            frame.push(arg1.clone());
                            frame.push(arg2);
                            frame.push(arg1);
                        }
                    }
                }
            }
        }
        Swap => {
            let arg1 = frame.pop_width(1)?;
            let arg2 = frame.pop_width(1)?;
            frame.push(arg1);
            frame.push(arg2);
        }

        IAdd | ISub | IMul | IDiv | IRem | IAnd | IOr | IXor | ISh(_) => {
            frame.pop()?;
            frame.pop()?;
            frame.push(Integer);
        }
        LAdd | LSub | LMul | LDiv | LRem | LAnd | LOr | LXor => {
            frame.pop_width(2)?;
            frame.pop_width(2)?;
            frame.push(Long);
        }
        FAdd | FSub | FMul | FDiv | FRem => {
            frame.pop()?;
            frame.pop()?;
            frame.push(Float);
        }
        DAdd | DSub | DMul | DDiv | DRem => {
            frame.pop_width(2)?;
            frame.pop_width(2)?;
            frame.push(Double);
        }
        LSh(_) => {
            frame.pop_width(1)?;
            frame.pop_width(2)?;
            frame.push(Long);
        }
        INeg | I2B | I2C | I2S => {
            frame.pop()?;
            frame.push(Integer);
        }
        LNeg => {
            frame.pop_width(2)?;
            frame.push(Long);
        }
        FNeg => {
            frame.pop()?;
            frame.push(Float);
        }
        DNeg => {
            frame.pop_width(2)?;
            frame.push(Double);
        }
        IInc(index, _) => {
            frame.get_local(*index)?;
        }

        I2L => {
            frame.pop()?;
            frame.push(Long);
        }
        I2F => {
            frame.pop()?;
            frame.push(Float);
        }
        I2D => {
            frame.pop()?;
            frame.push(Double);
        }
        L2I => {
            frame.pop_width(2)?;
            frame.push(Integer);
        }
        L2F => {
            frame.pop_width(2)?;
            frame.push(Float);
        }
        L2D => {
            frame.pop_width(2)?;
            frame.push(Double);
        }
        F2I => {
            frame.pop()?;
            frame.push(Integer);
        }
        F2L => {
            frame.pop()?;
            frame.push(Long);
        }
        F2D => {
            frame.pop()?;
            frame.push(Double);
        }
        D2I => {
            frame.pop_width(2)?;
            frame.push(Integer);
        }
        D2L => {
            frame.pop_width(2)?;
            frame.push(Long);
        }
        D2F => {
            frame.pop_width(2)?;
            frame.push(Float);
        }

        LCmp => {
            frame.pop_width(2)?;
            frame.pop_width(2)?;
            frame.push(Integer);
        }
        FCmp(_) => {
            frame.pop()?;
            frame.pop()?;
            frame.push(Integer);
        }
        DCmp(_) => {
            frame.pop_width(2)?;
            frame.pop_width(2)?;
            frame.push(Integer);
        }

        GetStatic(field) => {
            frame.push(VType::from(&field.descriptor));
        }
        PutStatic(field) => {
            frame.pop_width(VType::from(&field.descriptor).width())?;
        }
        GetField(field) => {
            frame.pop()?;
            frame.push(VType::from(&field.descriptor));
        }
        PutField(field) => {
            frame.pop_width(VType::from(&field.descriptor).width())?;
            frame.pop()?;
        }

        Invoke(invoke_type, method) => {
            for parameter in method.descriptor.parameters.iter().rev() {
                frame.pop_width(VType::from(parameter).width())?;
            }

            let is_init = method.name == UnqualifiedName::INIT;
            if is_init && matches!(invoke_type, crate::code::InvokeType::Special) {
                // The receiver stops being uninitialized, everywhere at once
                let receiver = frame.pop()?;
                match &receiver {
                    UninitializedThis => {
                        let initialized = Object(RefType::Object(ctx.this_class.clone()));
                        frame.replace_all(&receiver, &initialized);
                    }
                    Uninitialized(site) => {
                        let initialized = Object(RefType::Object(site.class.clone()));
                        frame.replace_all(&receiver, &initialized);
                    }
                    _ => return Err(FrameErrorKind::InvalidReceiver),
                }
            } else {
                if !matches!(invoke_type, crate::code::InvokeType::Static) {
                    frame.pop()?;
                }
                if let Some(return_type) = &method.descriptor.return_type {
                    frame.push(VType::from(return_type));
                }
            }
        }
        InvokeDynamic(indy) => {
            for parameter in indy.descriptor.parameters.iter().rev() {
                frame.pop_width(VType::from(parameter).width())?;
            }
            if let Some(return_type) = &indy.descriptor.return_type {
                frame.push(VType::from(return_type));
            }
        }

        New(ref_type) => match ref_type {
            RefType::Object(class) => frame.push(Uninitialized(UninitializedSite {
                class: class.clone(),
                block: ctx.block,
                offset_in_block: ctx.offset_in_block,
            })),
            other => {
                return Err(FrameErrorKind::BadDescriptor(format!(
                    "`new` cannot construct array type {:?}",
                    other
                )))
            }
        },
        NewArray(base_type) => {
            frame.pop()?;
            frame.push(Object(RefType::PrimitiveArray(ArrayType {
                additional_dimensions: 0,
                element_type: *base_type,
            })));
        }
        ANewArray(ref_type) => {
            frame.pop()?;
            frame.push(Object(RefType::array(FieldType::Ref(ref_type.clone()))));
        }
        MultiANewArray(ref_type, dimensions) => {
            for _ in 0..*dimensions {
                frame.pop()?;
            }
            frame.push(Object(ref_type.clone()));
        }
        ArrayLength => {
            frame.pop()?;
            frame.push(Integer);
        }

        CheckCast(ref_type) => {
            frame.pop()?;
            frame.push(Object(ref_type.clone()));
        }
        InstanceOf(_) => {
            frame.pop()?;
            frame.push(Integer);
        }
        MonitorEnter | MonitorExit => {
            frame.pop()?;
        }
    }

    Ok(())
}

/// Update the frame to reflect the operands a branching instruction consumes
///
/// The resulting frame is what every successor of the block sees (branches
/// never touch the local variables).
pub fn execute_branch<Lbl, LblWide, LblNext>(
    insn: &BranchInstruction<Lbl, LblWide, LblNext>,
    frame: &mut FrameState,
) -> Result<(), FrameErrorKind> {
    use BranchInstruction::*;

    match insn {
        If(_, _, _) | IfNull(_, _, _) | TableSwitch { .. } | LookupSwitch { .. } => {
            frame.pop_width(1)?;
        }
        IfICmp(_, _, _) | IfACmp(_, _, _) => {
            frame.pop_width(1)?;
            frame.pop_width(1)?;
        }
        Goto(_) | GotoW(_) | Return | FallThrough(_) => (),
        IReturn | FReturn | AReturn | AThrow => {
            frame.pop_width(1)?;
        }
        LReturn | DReturn => {
            frame.pop_width(2)?;
        }
    }

    Ok(())
}
