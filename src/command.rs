//! The REPL command dispatcher (spec.md §6 "operator-facing surface").
//! Ported close to verbatim from the teacher's `command.rs`: a
//! `CommandMap<T>` of named processors, each with declared positional/
//! keyword fields and boolean flags, dispatched by `dispatch_command`.

use std::cmp::max;
use std::collections::HashMap;
use std::error::Error;

#[derive(Clone)]
pub struct Command<T> {
    pub processor: CommandProcessor<T>,
    pub expected_fields: Vec<Field>,
    pub flags: Vec<Flag>,
    pub desc: String,
}

/// The function that actually executes the command. Accepts the parsed
/// invocation and the state/context object.
pub type CommandProcessor<T> = fn(invocation: &CommandInvocation, state: Option<T>) -> Result<(), Box<dyn Error>>;
pub type CommandMap<T> = HashMap<String, Command<T>>;

pub struct CommandInvocation {
    /// The name of the command that was invoked.
    pub name: String,

    /// Boolean flags passed to the command with '--flag' syntax.
    pub flags: Vec<String>,

    /// Ordered args passed to the command with '--' args removed.
    pub args: Vec<String>,

    /// Args passed to the command with '--field=value' syntax.
    pub vars: HashMap<String, String>,

    /// Values for expected fields, regardless of how they were passed.
    pub fields: HashMap<String, String>,
}

impl CommandInvocation {
    pub fn get_flag(&self, flag: &str) -> bool {
        self.flags.contains(&flag.to_owned())
    }

    pub fn get_field(&self, field_name: &str) -> Option<String> {
        self.fields.get(&field_name.to_owned()).cloned()
    }
}

#[derive(Clone)]
pub struct Field {
    pub name: String,
    pub field_type: FieldType,
    pub desc: String,
}

#[derive(Clone)]
pub struct Flag {
    pub name: String,
    pub desc: String,
}

#[derive(Clone, Copy, PartialEq)]
pub enum FieldType {
    /// A "var" must be passed in as a named variable with --name=value syntax.
    Var,

    /// A pos argument is expected at the given position in the args vector
    /// if not passed in as a var.
    Pos(usize),

    /// A spaces argument, if not passed as a var, consists of every token
    /// from the given position to the end, joined by spaces. Should only
    /// ever be the last expected field.
    Spaces(usize),
}

impl Field {
    pub fn new(name: &str, field_type: FieldType, desc: &str) -> Self {
        Field {
            name: name.to_owned(),
            field_type,
            desc: desc.to_owned(),
        }
    }
}

impl Flag {
    pub fn new(name: &str, desc: &str) -> Self {
        Flag {
            name: name.to_owned(),
            desc: desc.to_owned(),
        }
    }
}

pub fn dispatch_command<T>(args: &[String], map: &CommandMap<T>, state: Option<T>) {
    if args.is_empty() {
        println!("Missing command");
        return;
    }

    let cmd_name = &args[0];

    if cmd_name == "help" {
        if args.len() < 2 {
            help(map);
        } else {
            help_cmd(map, args[1].clone());
        }
        return;
    }

    let command = match map.get(cmd_name) {
        Some(obj) => obj.clone(),
        None => {
            println!("Unrecognized command: {cmd_name}");
            return;
        }
    };

    let invocation = match decompose_raw_args(args, &command.expected_fields) {
        Ok(inv) => inv,
        Err(err) => {
            println!("{err}");
            return;
        }
    };

    if let Err(err) = (command.processor)(&invocation, state) {
        println!("Error executing command: {err}");
    }
}

fn decompose_raw_args(raw_args: &[String], expected_fields: &[Field]) -> Result<CommandInvocation, Box<dyn Error>> {
    let cmd_name = &raw_args[0];
    let trimmed_args = &raw_args[1..];
    let mut assignments: HashMap<String, String> = HashMap::new();
    let (specials, ordered_args): (Vec<String>, Vec<String>) =
        trimmed_args.iter().cloned().partition(|s| s.starts_with("--"));

    let (assignment_strs, flags): (Vec<String>, Vec<String>) = specials
        .iter()
        .map(|s| s.trim_start_matches("--").to_owned())
        .partition(|s| s.contains('='));

    for assignment in assignment_strs {
        let mut pair = assignment.splitn(2, '=');
        let key = pair.next().unwrap_or_default().to_owned();
        let value = pair.next().unwrap_or_default().to_owned();
        assignments.insert(key, value);
    }

    let mut fields: HashMap<String, String> = HashMap::new();
    let mut pos_fields: Vec<Field> = vec![];

    for Field { name, field_type, desc } in expected_fields {
        let var_field = assignments.get(name).cloned();

        match (field_type, var_field) {
            (FieldType::Var, Some(var)) => drop(fields.insert(name.to_owned(), var)),
            (FieldType::Var, None) => {
                return Err(format!("Missing expected argument {name}. Pass this in with --{name}=<value>"))?
            }
            (FieldType::Pos(_) | FieldType::Spaces(_), Some(var)) => drop(fields.insert(name.to_owned(), var)),
            (FieldType::Pos(_), None) => pos_fields.push(Field::new(name, FieldType::Pos(pos_fields.len()), desc)),
            (FieldType::Spaces(_), None) => {
                pos_fields.push(Field::new(name, FieldType::Spaces(pos_fields.len()), desc))
            }
        }
    }

    for Field { name, field_type, desc: _ } in pos_fields {
        match field_type {
            FieldType::Var => unreachable!(),
            FieldType::Pos(pos) if pos < ordered_args.len() => {
                drop(fields.insert(name.clone(), ordered_args[pos].clone()))
            }
            FieldType::Spaces(pos) if pos < ordered_args.len() => {
                drop(fields.insert(name.clone(), ordered_args[pos..].join(" ")))
            }
            _ => return Err(format!("Not enough arguments: missing expected argument {name}"))?,
        };
    }

    Ok(CommandInvocation {
        name: cmd_name.to_owned(),
        flags,
        args: ordered_args,
        vars: assignments,
        fields,
    })
}

fn help<T>(map: &CommandMap<T>) {
    println!("These are the supported commands. Do 'help command_name' to learn more about a specific command.\n");
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();

    for cmd_name in keys {
        let cmd = map.get(cmd_name).unwrap();
        println!("\t{}\n\t\t{}", cmd_name, cmd.desc);
    }
}

fn help_cmd<T>(map: &CommandMap<T>, cmd_name: String) {
    let command = match map.get(&cmd_name) {
        Some(obj) => obj,
        None => {
            println!("Unrecognized command: {cmd_name}");
            return;
        }
    };

    println!("{}\n", command.desc);
    println!("Syntax: \t{}", make_syntax_string(&cmd_name, command));

    let (vars, mut poses): (Vec<&Field>, Vec<&Field>) =
        command.expected_fields.iter().partition(|f| f.field_type == FieldType::Var);

    poses.sort_by_key(|f| match f.field_type {
        FieldType::Pos(pos) => pos,
        FieldType::Spaces(pos) => pos,
        _ => unreachable!(),
    });

    let mut var_names: Vec<(String, String)> = vars.iter().map(|f| (f.name.clone(), f.desc.clone())).collect();
    var_names.sort();

    let mut flags = command.flags.clone();
    flags.sort_by_key(|f| f.name.clone());

    if !poses.is_empty() {
        println!("\nRequired arguments:\n");
        for field in poses {
            println!("\t{}\n\t\t{}", field.name, field.desc);
        }
    } else {
        println!("\nThere are no required positional arguments");
    }

    if !var_names.is_empty() {
        println!("\nRequired keyword arguments:\n");
        for (name, desc) in var_names {
            println!("\t--{name}\n\t\t{desc}");
        }
    }

    if !flags.is_empty() {
        println!("\nOptional flags:\n");
        for Flag { name, desc } in flags {
            println!("\t--{name}\n\t\t{desc}");
        }
    }
}

fn make_syntax_string<T>(name: &str, command: &Command<T>) -> String {
    let mut out = String::from(name);
    let mut max_pos: isize = -1;

    for field in &command.expected_fields {
        match field.field_type {
            FieldType::Pos(pos) | FieldType::Spaces(pos) => max_pos = max(max_pos, pos as isize),
            FieldType::Var => (),
        };
    }

    let mut names: Vec<String> = vec![String::new(); (max_pos + 1).max(0) as usize];

    for Field { name, field_type, desc: _ } in &command.expected_fields {
        match field_type {
            FieldType::Pos(pos) | FieldType::Spaces(pos) => names[*pos] = name.clone(),
            FieldType::Var => (),
        };
    }

    for name in names {
        out.push_str(" <");
        out.push_str(&name);
        out.push('>');
    }

    out
}
