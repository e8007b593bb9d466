//! 行式命令行客户端
//!
//! 以 `/` 开头的行是命令，其余的行作为输入状态上报后发送为消息。

use anyhow::Result;
use application::{ApplicationError, ChatSession, StreamEntry, Subscription};
use domain::{Conversation, ConversationId, EventId, EventKind, Identity, ServerEvent, Viewer};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    List,
    Find(String),
    Open(ConversationId),
    Start {
        event_id: EventId,
        counterpart: Option<Identity>,
    },
    Who,
    Show,
    Reload,
    Help,
    Quit,
    Say(String),
    Empty,
}

pub fn parse(line: &str) -> Result<Command, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Command::Empty);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Command::Say(line.to_owned()));
    };

    let mut parts = rest.split_whitespace();
    let name = parts.next().unwrap_or_default();
    let args: Vec<&str> = parts.collect();
    match (name, args.as_slice()) {
        ("list", []) => Ok(Command::List),
        ("find", [_, ..]) => Ok(Command::Find(args.join(" "))),
        ("open", [id]) => Ok(Command::Open(ConversationId::new(*id))),
        ("start", [event_id]) => Ok(Command::Start {
            event_id: EventId::new(*event_id),
            counterpart: None,
        }),
        ("start", [event_id, counterpart]) => Ok(Command::Start {
            event_id: EventId::new(*event_id),
            counterpart: Some(Identity::new(*counterpart)),
        }),
        ("who", []) => Ok(Command::Who),
        ("show", []) => Ok(Command::Show),
        ("reload", []) => Ok(Command::Reload),
        ("help", []) => Ok(Command::Help),
        ("quit", []) | ("exit", []) => Ok(Command::Quit),
        _ => Err(format!("无法识别的命令: /{rest}，输入 /help 查看用法")),
    }
}

const HELP: &str = "\
命令:
  /list                         列出会话
  /find <关键字>                按对方名字或活动标题搜索
  /open <会话id>                打开会话
  /start <活动id> [对方id]      围绕活动发起会话
  /who                          在线用户
  /show                         显示当前会话消息
  /reload                       重新拉取会话列表和当前消息
  /quit                         退出
其他输入直接作为消息发送";

pub async fn run(session: ChatSession, viewer: Viewer) -> Result<()> {
    let _subscriptions = watch_pushes(&session, &viewer);

    let mut states = session.watch_connection();
    let state_printer = tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            println!("[连接] {state:?}");
        }
    });

    match session.refresh_conversations().await {
        Ok(()) => print_conversations(&session, &viewer, &session.conversations()),
        Err(err) => println!("加载会话列表失败: {err}"),
    }
    println!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match parse(&line) {
            Ok(Command::Quit) => break,
            Ok(command) => execute(&session, &viewer, command).await,
            Err(message) => println!("{message}"),
        }
    }

    state_printer.abort();
    Ok(())
}

// 推送打印只捕获查看者身份，不持有会话
fn watch_pushes(session: &ChatSession, viewer: &Viewer) -> Vec<Subscription> {
    let me = viewer.identity.clone();
    let messages = session
        .connection()
        .subscribe(EventKind::NewMessage, move |event| {
            if let ServerEvent::NewMessage(message) = event {
                if message.sender_id != me {
                    println!(
                        "[{}] {}: {}",
                        message.conversation_id, message.sender_id, message.content
                    );
                }
            }
        });
    let typing = session
        .connection()
        .subscribe(EventKind::UserTyping, |event| {
            if let ServerEvent::UserTyping(update) = event {
                if update.is_typing {
                    println!("[{}] {} 正在输入…", update.conversation_id, update.identity);
                }
            }
        });
    vec![messages, typing]
}

async fn execute(session: &ChatSession, viewer: &Viewer, command: Command) {
    debug!(?command, "执行命令");
    match command {
        Command::Empty | Command::Quit => {}
        Command::Help => println!("{HELP}"),
        Command::List => print_conversations(session, viewer, &session.conversations()),
        Command::Find(query) => {
            print_conversations(session, viewer, &session.filter_conversations(&query))
        }
        Command::Open(id) => match session.select_conversation(&id).await {
            Ok(id) => {
                println!("已打开会话 {id}");
                print_messages(session);
            }
            Err(err) => report(err),
        },
        Command::Start {
            event_id,
            counterpart,
        } => match session.start_conversation(&event_id, counterpart).await {
            Ok(id) => {
                println!("已发起会话 {id}");
                print_messages(session);
            }
            Err(err) => report(err),
        },
        Command::Who => {
            let users = session.online_users();
            println!("在线 {} 人", users.len());
            for user in users {
                println!("  {user}");
            }
        }
        Command::Show => print_messages(session),
        Command::Reload => {
            if let Err(err) = session.refresh_conversations().await {
                report(err);
            }
            if session.selected_conversation().is_some() {
                match session.load_messages().await {
                    Ok(_) => print_messages(session),
                    Err(err) => report(err),
                }
            }
        }
        Command::Say(text) => {
            session.notify_local_typing();
            match session.send_message(&text).await {
                Ok(message) => debug!(message_id = %message.id, "消息已确认"),
                Err(err) => report(err),
            }
        }
    }
}

fn report(err: ApplicationError) {
    warn!(error = %err, "命令失败");
    match &err {
        ApplicationError::NotSelected => println!("请先用 /open 打开一个会话"),
        _ => println!("失败: {err}"),
    }
    if let Some(content) = err.restorable_content() {
        println!("未发送的内容（可重新输入）: {content}");
    }
}

fn print_conversations(session: &ChatSession, viewer: &Viewer, conversations: &[Conversation]) {
    if conversations.is_empty() {
        println!("（没有会话）");
        return;
    }
    let selected = session.selected_conversation();
    for conversation in conversations {
        let counterpart = conversation.counterpart(viewer);
        let marker = if selected.as_ref() == Some(&conversation.id) {
            '*'
        } else {
            ' '
        };
        let online = if session.is_online(&counterpart.id) {
            "在线"
        } else {
            "离线"
        };
        let events: Vec<&str> = conversation
            .events
            .iter()
            .map(|event| event.title.as_str())
            .collect();
        println!(
            "{marker} {} {} ({online}) [{}] {}",
            conversation.id,
            counterpart.name,
            events.join(", "),
            conversation.last_message.as_deref().unwrap_or("")
        );
    }
}

fn print_messages(session: &ChatSession) {
    for (day, entries) in session.messages_by_day() {
        println!("── {day} ──");
        for entry in entries {
            print_entry(&entry);
        }
    }
    if let Some(id) = session.selected_conversation() {
        if let Some(typer) = session.typer(&id) {
            println!("{typer} 正在输入…");
        }
    }
}

fn print_entry(entry: &StreamEntry) {
    let pending = if entry.is_pending() { " (发送中)" } else { "" };
    println!(
        "{} {}: {}{pending}",
        entry.created_at().format("%H:%M"),
        entry.sender_id(),
        entry.content()
    );
}
