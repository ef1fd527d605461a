use anyhow::Result;
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use log::debug;
use ratatui::{
    prelude::*,
    widgets::{Block, Borders, List, ListItem, ListState, Paragraph},
    Frame,
};
use std::{io, time::Duration};
use textwrap::wrap;
use tui_input::{backend::crossterm::EventHandler, Input};

use portal_chat::{ChatSnapshot, Conversation, ConversationRef, Message, MessageStatus, OnlineStatus};

use crate::utils::format_time;

pub use ratatui::backend::CrosstermBackend;
pub use ratatui::Terminal;

/// Something the user asked for. Each one is handed to the synchronizer on
/// its own task so the view never waits on the network.
#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    Select(ConversationRef),
    Send(String),
    Typing,
    Delete(String),
    Edit { message_id: String, text: String },
    Retry(String),
    Block(String),
    Unblock(String),
    Older,
    ClearError,
    Quit,
}

/// Slash commands typed into the composer. Message numbers are the 1-based
/// indices shown next to each message.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Delete(usize),
    Edit(usize, String),
    Retry(usize),
    Block,
    Unblock,
    Older,
    Clear,
}

pub fn parse_command(line: &str) -> Option<std::result::Result<Command, String>> {
    let line = line.trim();
    let rest = line.strip_prefix('/')?;
    let (name, args) = match rest.split_once(char::is_whitespace) {
        Some((name, args)) => (name, args.trim()),
        None => (rest, ""),
    };

    let index = |args: &str| -> std::result::Result<usize, String> {
        args.split_whitespace()
            .next()
            .and_then(|n| n.parse::<usize>().ok())
            .filter(|n| *n > 0)
            .ok_or_else(|| format!("/{} needs a message number", name))
    };

    let command = match name {
        "delete" | "del" => index(args).map(Command::Delete),
        "retry" => index(args).map(Command::Retry),
        "edit" => index(args).and_then(|n| {
            let text = args
                .split_once(char::is_whitespace)
                .map(|(_, text)| text.trim().to_string())
                .unwrap_or_default();
            if text.is_empty() {
                Err("/edit needs the new text".to_string())
            } else {
                Ok(Command::Edit(n, text))
            }
        }),
        "block" => Ok(Command::Block),
        "unblock" => Ok(Command::Unblock),
        "older" => Ok(Command::Older),
        "clear" => Ok(Command::Clear),
        other => Err(format!("Unknown command /{}", other)),
    };
    Some(command)
}

enum Focus {
    Conversations,
    Composer,
}

pub struct ChatView {
    snapshot: ChatSnapshot,
    me: String,
    input: Input,
    focus: Focus,
    sidebar: ListState,
    notice: Option<String>,
}

impl ChatView {
    pub fn new(me: &str) -> Self {
        ChatView {
            snapshot: ChatSnapshot::default(),
            me: me.to_string(),
            input: Input::default(),
            focus: Focus::Conversations,
            sidebar: ListState::default(),
            notice: None,
        }
    }

    pub fn snapshot(&self) -> &ChatSnapshot {
        &self.snapshot
    }

    pub fn update(&mut self, snapshot: ChatSnapshot) {
        self.snapshot = snapshot;
        let count = self.snapshot.conversations.len();
        let selected = match self.sidebar.selected() {
            _ if count == 0 => None,
            Some(i) => Some(i.min(count - 1)),
            None => self
                .snapshot
                .selected
                .as_ref()
                .and_then(|s| {
                    self.snapshot
                        .conversations
                        .iter()
                        .position(|c| c.conversation_id == s.conversation_id)
                })
                .or(Some(0)),
        };
        self.sidebar.select(selected);
    }

    pub fn set_notice(&mut self, notice: impl Into<String>) {
        self.notice = Some(notice.into());
    }

    /// Poll the terminal briefly and translate a key press into an intent.
    pub fn handle_input(&mut self) -> Result<Option<Intent>> {
        if event::poll(Duration::from_millis(50))? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    return Ok(self.handle_key(key));
                }
            }
        }
        Ok(None)
    }

    pub fn handle_key(&mut self, key: KeyEvent) -> Option<Intent> {
        match key.code {
            KeyCode::Esc => return Some(Intent::Quit),
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                return Some(Intent::Quit)
            }
            KeyCode::Tab => {
                self.focus = match self.focus {
                    Focus::Conversations => Focus::Composer,
                    Focus::Composer => Focus::Conversations,
                };
                return None;
            }
            KeyCode::PageUp => return Some(Intent::Older),
            _ => {}
        }

        match self.focus {
            Focus::Conversations => self.handle_sidebar_key(key),
            Focus::Composer => self.handle_composer_key(key),
        }
    }

    fn handle_sidebar_key(&mut self, key: KeyEvent) -> Option<Intent> {
        let count = self.snapshot.conversations.len();
        if count == 0 {
            return None;
        }
        let current = self.sidebar.selected().unwrap_or(0);
        match key.code {
            KeyCode::Up => {
                self.sidebar.select(Some(current.saturating_sub(1)));
                None
            }
            KeyCode::Down => {
                self.sidebar.select(Some((current + 1).min(count - 1)));
                None
            }
            KeyCode::Enter => {
                let conversation = self.snapshot.conversations.get(current)?;
                self.focus = Focus::Composer;
                self.notice = None;
                Some(Intent::Select(ConversationRef::from(conversation)))
            }
            _ => None,
        }
    }

    fn handle_composer_key(&mut self, key: KeyEvent) -> Option<Intent> {
        if key.code == KeyCode::Enter {
            let line = self.input.value().to_string();
            if line.trim().is_empty() {
                return None;
            }
            let intent = self.submit(&line);
            if intent.is_some() {
                self.input.reset();
            }
            return intent;
        }

        let changed = self
            .input
            .handle_event(&Event::Key(key))
            .map(|c| c.value)
            .unwrap_or(false);
        let composing = !self.input.value().starts_with('/');
        if changed && composing && self.snapshot.can_compose() && !self.input.value().is_empty() {
            return Some(Intent::Typing);
        }
        None
    }

    /// Turn a composer line into an intent, or leave a notice explaining why
    /// it can't be done.
    fn submit(&mut self, line: &str) -> Option<Intent> {
        self.notice = None;
        let command = match parse_command(line) {
            Some(Ok(command)) => command,
            Some(Err(problem)) => {
                self.notice = Some(problem);
                return None;
            }
            None => {
                if self.snapshot.selected.is_none() {
                    self.notice = Some("Pick a conversation first".to_string());
                    return None;
                }
                if !self.snapshot.can_compose() {
                    self.notice = Some(self.composer_hint().to_string());
                    return None;
                }
                return Some(Intent::Send(line.to_string()));
            }
        };

        match command {
            Command::Delete(n) => self.message_at(n).map(|m| Intent::Delete(m.message_id.clone())),
            Command::Retry(n) => {
                let (message_id, status) = self.message_at(n).map(|m| (m.message_id.clone(), m.status))?;
                if status != MessageStatus::Failed {
                    self.notice = Some(format!("Message {} has not failed", n));
                    return None;
                }
                Some(Intent::Retry(message_id))
            }
            Command::Edit(n, text) => self.message_at(n).map(|m| Intent::Edit {
                message_id: m.message_id.clone(),
                text,
            }),
            Command::Block => self.selected_participant().map(Intent::Block),
            Command::Unblock => self.selected_participant().map(Intent::Unblock),
            Command::Older => Some(Intent::Older),
            Command::Clear => Some(Intent::ClearError),
        }
    }

    fn message_at(&mut self, n: usize) -> Option<&Message> {
        if n == 0 || n > self.snapshot.messages.len() {
            self.notice = Some(format!("No message {}", n));
            return None;
        }
        self.snapshot.messages.get(n - 1)
    }

    fn selected_participant(&mut self) -> Option<String> {
        match &self.snapshot.selected {
            Some(conversation) => Some(conversation.other_participant_id.clone()),
            None => {
                self.notice = Some("Pick a conversation first".to_string());
                None
            }
        }
    }

    fn composer_hint(&self) -> &'static str {
        match &self.snapshot.selected {
            None => "Pick a conversation first",
            Some(c) if c.is_blocked => "Blocked. /unblock to chat again",
            Some(_) => "Not connected",
        }
    }

    pub fn draw<B: Backend>(&mut self, frame: &mut Frame<B>) {
        let size = frame.size();

        let chunks = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(25), Constraint::Percentage(75)])
            .split(size);

        let chat_chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(3), // header
                Constraint::Min(5),    // messages
                Constraint::Length(3), // composer
                Constraint::Length(1), // status / help
            ])
            .split(chunks[1]);

        let focused = self.is_focused_on_sidebar();
        draw_sidebar(frame, chunks[0], &self.snapshot, &mut self.sidebar, focused);
        draw_header(frame, chat_chunks[0], &self.snapshot);
        draw_messages(frame, chat_chunks[1], &self.snapshot, &self.me);

        let enabled = self.snapshot.can_compose();
        let title = if enabled {
            "Message".to_string()
        } else {
            format!("Message ({})", self.composer_hint())
        };
        let border = match (&self.focus, enabled) {
            (Focus::Composer, true) => Style::default().fg(Color::Yellow),
            (Focus::Composer, false) => Style::default().fg(Color::DarkGray),
            _ => Style::default(),
        };
        let input_widget = Paragraph::new(self.input.value())
            .style(if enabled {
                Style::default()
            } else {
                Style::default().fg(Color::DarkGray)
            })
            .block(Block::default().title(title).borders(Borders::ALL).border_style(border));
        frame.render_widget(input_widget, chat_chunks[2]);

        let status_line = if let Some(error) = &self.snapshot.error {
            Line::from(vec![
                Span::styled(error.clone(), Style::default().fg(Color::Red)),
                Span::styled("  (/clear)", Style::default().fg(Color::Gray)),
            ])
        } else if let Some(notice) = &self.notice {
            Line::from(Span::styled(notice.clone(), Style::default().fg(Color::Yellow)))
        } else {
            Line::from(Span::styled(
                "ESC quit | TAB focus | /delete N | /edit N text | /retry N | /block | /unblock | /older",
                Style::default().fg(Color::Gray),
            ))
        };
        frame.render_widget(Paragraph::new(status_line), chat_chunks[3]);

        if let Focus::Composer = self.focus {
            frame.set_cursor(
                chat_chunks[2].x + self.input.cursor() as u16 + 1,
                chat_chunks[2].y + 1,
            );
        }
    }

    fn is_focused_on_sidebar(&self) -> bool {
        matches!(self.focus, Focus::Conversations)
    }
}

fn sidebar_line(conversation: &Conversation, active: bool) -> Line<'static> {
    let presence = match conversation.online_status {
        OnlineStatus::Online => Span::styled("● ", Style::default().fg(Color::Green)),
        OnlineStatus::Offline => Span::styled("○ ", Style::default().fg(Color::DarkGray)),
    };
    let name_style = if active {
        Style::default().add_modifier(Modifier::BOLD)
    } else {
        Style::default()
    };
    let mut spans = vec![presence, Span::styled(conversation.display_name.clone(), name_style)];
    if conversation.is_blocked {
        spans.push(Span::styled(" [blocked]", Style::default().fg(Color::Red)));
    } else if conversation.unread_count > 0 {
        spans.push(Span::styled(
            format!(" ({})", conversation.unread_count),
            Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
        ));
    }
    Line::from(spans)
}

fn draw_sidebar<B: Backend>(
    f: &mut Frame<B>,
    area: Rect,
    snapshot: &ChatSnapshot,
    state: &mut ListState,
    focused: bool,
) {
    let active_id = snapshot.selected.as_ref().map(|c| c.conversation_id.as_str());
    let items: Vec<ListItem> = snapshot
        .conversations
        .iter()
        .map(|c| {
            let active = Some(c.conversation_id.as_str()) == active_id;
            let mut lines = vec![sidebar_line(c, active)];
            if let Some(preview) = &c.last_message_text {
                let width = area.width.saturating_sub(6) as usize;
                let preview: String = preview.chars().take(width.max(1)).collect();
                lines.push(Line::from(Span::styled(
                    format!("  {}", preview),
                    Style::default().fg(Color::Gray),
                )));
            }
            ListItem::new(Text::from(lines))
        })
        .collect();

    let list = List::new(items)
        .block(
            Block::default()
                .title("Conversations (Tab to focus)")
                .borders(Borders::ALL)
                .border_style(if focused {
                    Style::default().fg(Color::Yellow)
                } else {
                    Style::default()
                }),
        )
        .highlight_symbol("> ");
    f.render_stateful_widget(list, area, state);
}

fn draw_header<B: Backend>(f: &mut Frame<B>, area: Rect, snapshot: &ChatSnapshot) {
    let connection_style = if snapshot.connection.is_open() {
        Style::default().fg(Color::Green)
    } else {
        Style::default().fg(Color::Red)
    };

    let (title, typing) = match &snapshot.selected {
        Some(conversation) => {
            let typing = if snapshot.typing_users.is_empty() {
                String::new()
            } else {
                format!("{} is typing...", conversation.display_name)
            };
            (conversation.display_name.clone(), typing)
        }
        None => ("No conversation selected".to_string(), String::new()),
    };

    let mut first = vec![
        Span::styled(title, Style::default().add_modifier(Modifier::BOLD)),
        Span::raw("  "),
        Span::styled(format!("[{}]", snapshot.connection.label()), connection_style),
    ];
    if snapshot.loading {
        first.push(Span::styled("  loading...", Style::default().fg(Color::Gray)));
    }
    let text = Text::from(vec![
        Line::from(first),
        Line::from(Span::styled(typing, Style::default().fg(Color::Cyan))),
    ]);
    f.render_widget(Paragraph::new(text).block(Block::default().borders(Borders::BOTTOM)), area);
}

fn status_marker(status: MessageStatus) -> &'static str {
    match status {
        MessageStatus::Sending => " …",
        MessageStatus::Delivered => " ✓",
        MessageStatus::Read => " ✓✓",
        MessageStatus::Failed => " ✗ failed",
    }
}

fn draw_messages<B: Backend>(f: &mut Frame<B>, area: Rect, snapshot: &ChatSnapshot, me: &str) {
    let wrap_width = area.width.saturating_sub(2).max(1) as usize;
    let other_name = snapshot
        .selected
        .as_ref()
        .map(|c| c.display_name.as_str())
        .unwrap_or("");

    let mut items: Vec<ListItem> = Vec::new();
    if snapshot.has_older && !snapshot.messages.is_empty() {
        items.push(
            ListItem::new("  … older messages (PgUp or /older)")
                .style(Style::default().fg(Color::DarkGray)),
        );
    }

    for (i, m) in snapshot.messages.iter().enumerate() {
        let own = m.is_own(me);
        let author = if own {
            "You"
        } else if !m.sender_name.is_empty() && m.sender_name != m.sender_id {
            m.sender_name.as_str()
        } else {
            other_name
        };
        let edited = if m.is_edited { " (edited)" } else { "" };
        let marker = if own { status_marker(m.status) } else { "" };
        let full = format!(
            "[{}] {} {}: {}{}{}",
            i + 1,
            format_time(&m.timestamp),
            author,
            m.text,
            edited,
            marker
        );

        let style = if own {
            match m.status {
                MessageStatus::Failed => Style::default().fg(Color::Red),
                MessageStatus::Sending => Style::default().fg(Color::Blue),
                _ => Style::default().fg(Color::Green),
            }
        } else {
            Style::default()
        };

        for line in wrap(&full, wrap_width) {
            items.push(ListItem::new(Text::from(line.into_owned())).style(style));
        }
    }

    let mut list_state = ListState::default();
    if !items.is_empty() {
        list_state.select(Some(items.len() - 1));
    }
    debug!("Rendering {} message lines", items.len());

    let messages_list = List::new(items)
        .block(Block::default().borders(Borders::ALL).title("Messages"))
        .highlight_style(Style::default());
    f.render_stateful_widget(messages_list, area, &mut list_state);
}

pub fn setup_terminal() -> Result<Terminal<CrosstermBackend<io::Stdout>>> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let terminal = Terminal::new(backend)?;
    Ok(terminal)
}

pub fn restore_terminal(mut terminal: Terminal<CrosstermBackend<io::Stdout>>) -> Result<()> {
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}
