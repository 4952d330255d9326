// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

#[doc(hidden)]
#[macro_export]
macro_rules! __kmpp_field_name {
    ($field:ident) => {
        stringify!($field)
    };
    ($field:ident $alias:literal) => {
        $alias
    };
}

/// Declares a typed object definition.
///
/// ```ignore
/// kmpp_objdef! {
///     /// Encoder input frame.
///     pub struct KmppFrame: "frame" {
///         width: u32 = FlagDesc::base(),
///         height: u32 = FlagDesc::incr(),
///         prep_format("prep:format"): u32 = FlagDesc::incr(),
///     }
/// }
/// ```
///
/// Fields are laid out in declaration order with natural alignment. The
/// generated wrapper offers `register(&Registry)`, `bind(def)`, `def()`,
/// `get()`, `get_local()` and per field `set_<field>`, `get_<field>`,
/// `test_<field>` and `loc_<field>`. Accessors use locations resolved once at
/// bind time and fall back to raw layout offsets when the bound definition
/// has no entry for a field.
#[macro_export]
macro_rules! kmpp_objdef {
    (
        $(#[$meta:meta])*
        $vis:vis struct $def:ident : $name:literal {
            $(
                $(#[$fmeta:meta])*
                $field:ident $(($alias:literal))? : $ty:ty = $flag:expr
            ),* $(,)?
        }
    ) => {
        $crate::paste::paste! {
            #[doc(hidden)]
            #[derive(Debug, Clone, Copy)]
            #[allow(non_snake_case)]
            $vis struct [<$def Slots>] {
                $($field: $crate::FieldSlot,)*
            }

            $(#[$meta])*
            #[derive(Debug, Clone)]
            $vis struct $def {
                def: ::std::sync::Arc<$crate::ObjDef>,
                slots: [<$def Slots>],
            }

            impl $def {
                /// Definition name.
                pub const NAME: &'static str = $name;

                /// Field layout in declaration order.
                pub fn layout() -> $crate::Layout {
                    $crate::Layout::new()
                        $(.field::<$ty>($crate::__kmpp_field_name!($field $($alias)?), $flag))*
                }

                /// Imports or registers the definition and binds to it.
                pub fn register(registry: &$crate::Registry) -> $crate::Result<Self> {
                    let layout = Self::layout();
                    let def = registry.get_or_register($name, layout.size(), |builder| {
                        layout.apply(builder)
                    })?;
                    Ok(Self::bind(def))
                }

                /// Binds to an existing definition, resolving every field once.
                pub fn bind(def: ::std::sync::Arc<$crate::ObjDef>) -> Self {
                    let layout = Self::layout();
                    let slot = |name: &str| match def.get_entry(name) {
                        Ok(loc) => $crate::FieldSlot::Table(loc),
                        Err(_) => $crate::FieldSlot::Raw(layout.offset_of(name).unwrap_or(0)),
                    };
                    let slots = [<$def Slots>] {
                        $($field: slot($crate::__kmpp_field_name!($field $($alias)?)),)*
                    };
                    Self { def, slots }
                }

                pub fn def(&self) -> &::std::sync::Arc<$crate::ObjDef> {
                    &self.def
                }

                pub fn get(&self) -> $crate::Result<$crate::Obj> {
                    $crate::Obj::get(&self.def)
                }

                pub fn get_local(&self) -> $crate::Result<$crate::Obj> {
                    $crate::Obj::get_local(&self.def)
                }

                $(
                    $(#[$fmeta])*
                    pub fn [<set_ $field>](&self, obj: &$crate::Obj, value: $ty) -> $crate::Result<()> {
                        obj.slot_set(&self.slots.$field, value)
                    }

                    pub fn [<get_ $field>](&self, obj: &$crate::Obj) -> $crate::Result<$ty> {
                        obj.slot_get(&self.slots.$field)
                    }

                    pub fn [<test_ $field>](&self, obj: &$crate::Obj) -> $crate::Result<bool> {
                        obj.slot_test(&self.slots.$field)
                    }

                    pub fn [<loc_ $field>](&self) -> $crate::FieldSlot {
                        self.slots.$field
                    }
                )*
            }
        }
    };
}
